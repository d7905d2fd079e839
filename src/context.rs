//! The explicitly constructed state shared by all compilations for one
//! target.

use crate::config::Config;
use crate::helpers::HelperTable;
use crate::isa::{self, InstructionEncoder};
use crate::memory::CodeCache;
use crate::result::{CompileError, CompileResult};
use crate::runtime::SnippetData;
use crate::snippet::EmittedSnippet;
use crate::thunk::{TerseSignature, Thunk, ThunkTable};
use crate::trampoline::TrampolineTable;
use std::sync::Arc;
use target_lexicon::Triple;

/// Everything snippet generation needs beyond the method being compiled:
/// the target's encoder, the configuration, the runtime helper addresses,
/// the code cache and the trampolines and thunks living in it.
///
/// An `Environment` is `Sync`; methods may be compiled against it from
/// several threads at once. Internally, locks are only ever taken in the
/// order thunks, trampolines, code cache.
pub struct Environment {
    config: Config,
    isa: Box<dyn InstructionEncoder>,
    helpers: HelperTable,
    code_cache: CodeCache,
    trampolines: TrampolineTable,
    thunks: ThunkTable,
}

impl Environment {
    /// Creates the environment for `triple`, after checking that `config`
    /// is consistent.
    pub fn new(triple: Triple, config: Config, helpers: HelperTable) -> CompileResult<Self> {
        if let Err(err) = config.validate() {
            log::error!("{err}");
            return Err(CompileError::InvalidConfig(err.to_string()));
        }
        let isa = isa::lookup(triple)?;
        log::debug!(
            "environment for {} ({}-byte pointers), layout version {}",
            isa.triple(),
            isa.pointer_size(),
            crate::LAYOUT_VERSION
        );
        let code_cache = CodeCache::new(config.code_cache());
        Ok(Self {
            config,
            isa,
            helpers,
            code_cache,
            trampolines: TrampolineTable::new(),
            thunks: ThunkTable::new(),
        })
    }

    /// The target's encoder.
    pub fn isa(&self) -> &dyn InstructionEncoder {
        &*self.isa
    }

    /// The configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The runtime helper addresses.
    pub fn helpers(&self) -> &HelperTable {
        &self.helpers
    }

    /// The code cache.
    pub fn code_cache(&self) -> &CodeCache {
        &self.code_cache
    }

    /// The trampolines created so far.
    pub fn trampolines(&self) -> &TrampolineTable {
        &self.trampolines
    }

    /// The thunks created so far.
    pub fn thunks(&self) -> &ThunkTable {
        &self.thunks
    }

    /// The address a branch at `call_site` must use to reach `target`,
    /// which is a trampoline when `target` is out of range.
    pub fn resolve_branch_target(&self, target: u64, call_site: u64) -> CompileResult<u64> {
        self.trampolines.resolve_branch_target(
            self.isa(),
            &self.code_cache,
            self.config.dispatch().stress_trampolines,
            target,
            call_site,
        )
    }

    /// The interpreter-bridge thunk for `signature`.
    pub fn get_or_create_thunk(&self, signature: &TerseSignature) -> CompileResult<Arc<Thunk>> {
        self.thunks.get_or_create(self, signature)
    }

    /// The run-time view of an installed snippet's data area.
    pub fn snippet_data(&self, snippet: &EmittedSnippet) -> CompileResult<SnippetData<'_>> {
        SnippetData::new(
            &self.code_cache,
            snippet.data_address(),
            snippet.layout(),
            self.config.cache_shape(snippet.call_kind()).map(|(_, policy)| policy),
        )
    }
}
