//! Interpreter-bridge thunks.
//!
//! A thunk adapts a call made with the JIT linkage to the interpreter: it
//! flushes the argument registers to their stack slots and jumps to the
//! interpreter entry specialized for the return type. Its code depends only
//! on the call's *terse signature*, one character per argument type, so a
//! single thunk is shared by every call site with the same signature.
//! Thunks are created on first use, memoized in a trie keyed by the
//! signature's characters, and never change afterwards.

use crate::buffer::{CodeBuffer, Section};
use crate::context::Environment;
use crate::descriptor::{CallDescriptor, ValueType};
use crate::helpers::{HelperId, ReturnKind};
use crate::marshal::flush_arguments;
use crate::reloc::{LoadBases, RelocTarget, apply_relocation};
use crate::result::CompileResult;
use core::fmt;
use core::str::FromStr;
use smallvec::SmallVec;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[cfg(feature = "enable-serde")]
use serde_derive::{Deserialize, Serialize};

/// A call signature reduced to what matters for argument passing.
///
/// Written `(args)ret`: `I` for 8, 16 and 32-bit integers, `J` for 64-bit
/// integers, `L` for addresses, `F` and `D` for floats and doubles, `A` for
/// aggregates, and `V` as the return of a void call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct TerseSignature {
    args: Vec<ValueType>,
    ret: Option<ValueType>,
}

/// A terse signature could not be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// The text is not of the form `(args)ret`.
    #[error("malformed signature `{0}`: expected `(args)ret`")]
    Malformed(String),
    /// A character names no type.
    #[error("unknown type `{ch}` in signature `{text}`")]
    UnknownType {
        /// The character.
        ch: char,
        /// The whole signature.
        text: String,
    },
}

fn normalize(ty: ValueType) -> ValueType {
    match ty {
        ValueType::Int8 | ValueType::Int16 => ValueType::Int32,
        ty => ty,
    }
}

impl TerseSignature {
    /// The signature of arguments `args` returning `ret`.
    pub fn new(args: &[ValueType], ret: Option<ValueType>) -> Self {
        Self {
            args: args.iter().copied().map(normalize).collect(),
            ret: ret.map(normalize),
        }
    }

    /// The signature of a call site.
    pub fn from_descriptor(desc: &CallDescriptor) -> Self {
        Self::new(&desc.args, desc.ret)
    }

    /// Parses `(args)ret`.
    pub fn parse(text: &str) -> Result<Self, SignatureError> {
        let malformed = || SignatureError::Malformed(text.to_string());
        let rest = text.strip_prefix('(').ok_or_else(malformed)?;
        let (args, ret) = rest.split_once(')').ok_or_else(malformed)?;
        let ty = |ch: char| {
            ValueType::from_terse_char(ch).ok_or_else(|| SignatureError::UnknownType {
                ch,
                text: text.to_string(),
            })
        };
        let args = args.chars().map(ty).collect::<Result<Vec<_>, _>>()?;
        let mut ret_chars = ret.chars();
        let ret = match (ret_chars.next(), ret_chars.next()) {
            (Some('V'), None) => None,
            (Some(ch), None) => Some(ty(ch)?),
            _ => return Err(malformed()),
        };
        Ok(Self { args, ret })
    }

    /// Argument types in call order.
    pub fn args(&self) -> &[ValueType] {
        &self.args
    }

    /// Return type, `None` for void.
    pub fn ret(&self) -> Option<ValueType> {
        self.ret
    }

    fn key(&self) -> SmallVec<[u8; 16]> {
        let mut key: SmallVec<[u8; 16]> = self.args.iter().map(|ty| ty.terse_char() as u8).collect();
        key.push(b')');
        key.push(self.ret.map_or('V', ValueType::terse_char) as u8);
        key
    }
}

impl FromStr for TerseSignature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TerseSignature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("(")?;
        for ty in &self.args {
            write!(f, "{}", ty.terse_char())?;
        }
        write!(f, "){}", self.ret.map_or('V', ValueType::terse_char))
    }
}

/// An installed interpreter-bridge thunk.
#[derive(Debug, PartialEq, Eq)]
pub struct Thunk {
    signature: TerseSignature,
    entry: u64,
    len: u32,
}

impl Thunk {
    /// The signature the thunk serves.
    pub fn signature(&self) -> &TerseSignature {
        &self.signature
    }

    /// Address of the thunk's first instruction.
    pub fn entry(&self) -> u64 {
        self.entry
    }

    /// Length of the thunk's code.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether the thunk has no code.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Default)]
struct TrieNode {
    children: SmallVec<[(u8, Box<TrieNode>); 4]>,
    thunk: Option<Arc<Thunk>>,
}

impl TrieNode {
    fn find(&self, key: &[u8]) -> Option<&TrieNode> {
        key.iter().try_fold(self, |node, byte| {
            node.children
                .iter()
                .find(|(b, _)| b == byte)
                .map(|(_, child)| &**child)
        })
    }

    fn find_or_insert(&mut self, key: &[u8]) -> &mut TrieNode {
        let mut node = self;
        for &byte in key {
            let pos = match node.children.iter().position(|(b, _)| *b == byte) {
                Some(pos) => pos,
                None => {
                    node.children.push((byte, Box::default()));
                    node.children.len() - 1
                }
            };
            node = &mut node.children[pos].1;
        }
        node
    }

    fn count(&self) -> usize {
        usize::from(self.thunk.is_some())
            + self.children.iter().map(|(_, c)| c.count()).sum::<usize>()
    }
}

/// Memoized thunks, keyed by signature.
#[derive(Default)]
pub struct ThunkTable {
    root: Mutex<TrieNode>,
}

impl ThunkTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The thunk for `signature`, if it has been created.
    pub fn get(&self, signature: &TerseSignature) -> Option<Arc<Thunk>> {
        let root = self.root.lock().unwrap_or_else(|e| e.into_inner());
        root.find(&signature.key())?.thunk.clone()
    }

    /// The thunk for `signature`, generating and installing it on first use.
    pub fn get_or_create(
        &self,
        env: &Environment,
        signature: &TerseSignature,
    ) -> CompileResult<Arc<Thunk>> {
        let mut root = self.root.lock().unwrap_or_else(|e| e.into_inner());
        let node = root.find_or_insert(&signature.key());
        if let Some(thunk) = &node.thunk {
            trace!("thunk {signature}: hit at {:#x}", thunk.entry);
            return Ok(thunk.clone());
        }
        let thunk = Arc::new(generate(env, signature)?);
        node.thunk = Some(thunk.clone());
        Ok(thunk)
    }

    /// Number of thunks created.
    pub fn len(&self) -> usize {
        self.root.lock().unwrap_or_else(|e| e.into_inner()).count()
    }

    /// Whether no thunk has been created.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Emits and installs the thunk for `signature`.
fn generate(env: &Environment, signature: &TerseSignature) -> CompileResult<Thunk> {
    let isa = env.isa();
    let ret = ReturnKind::from_return_type(signature.ret)?;
    let plan = flush_arguments(&signature.args, isa.abi(), 0);
    let len = plan.encoded_len(isa)? + isa.branch_len();

    let reservation = env
        .code_cache()
        .reserve(len, isa.instruction_alignment().max(u32::from(isa.pointer_size())))?;
    let mut buf = CodeBuffer::new(Section::Stubs, reservation.addr, len);
    plan.emit(isa, &mut buf)?;
    let dispatch = HelperId::ThunkDispatch(ret);
    isa.emit_jump(&mut buf, RelocTarget::Helper(dispatch))?;
    let code = buf.finish()?;
    env.code_cache().write(code.base, &code.data)?;

    let bases = LoadBases {
        method: code.base,
        stubs: code.base,
    };
    let target = env.helpers().resolve_helper_address(dispatch)?;
    for record in &code.relocs {
        apply_relocation(env, &bases, record, target)?;
    }

    log::debug!(
        "thunk {signature}: {len} bytes at {:#x}, dispatching to {dispatch}",
        code.base
    );
    Ok(Thunk {
        signature: signature.clone(),
        entry: code.base,
        len,
    })
}
