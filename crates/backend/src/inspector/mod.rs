//! Step collection from revm.

mod step_collector;

use alloy_primitives::{Address, Bytes, TxKind};
use eyre::{eyre, Result};
use revm::{
    primitives::{EnvWithHandlerCfg, ExecutionResult},
    Database,
};
use rustc_hash::FxHashMap;

pub use step_collector::StepCollector;

use crate::{
    analysis::matcher::BytecodeMatcher,
    artifact::ArtifactIndex,
    config::DebuggerConfig,
    trace::{RawStep, RootCall, Trace, TraceReconstructor},
    utils::evm::new_evm_with_inspector,
};

/// A transaction executed under a [`StepCollector`].
#[derive(Debug)]
pub struct CollectedTrace {
    pub root: RootCall,
    pub steps: Vec<RawStep>,
    /// Runtime code of every called account, by code address.
    pub codes: FxHashMap<Address, Bytes>,
    pub result: ExecutionResult,
}

impl CollectedTrace {
    /// Reconstructs the collected steps. A top-level creation is marked created only when the
    /// transaction succeeded.
    pub fn reconstruct(
        self,
        index: &ArtifactIndex,
        matcher: &BytecodeMatcher,
        config: DebuggerConfig,
    ) -> Result<Trace> {
        let succeeded = self.result.is_success();
        let mut reconstructor =
            TraceReconstructor::new(index, matcher, self.codes, self.root, config);
        for raw in self.steps {
            reconstructor.process(raw)?;
        }
        Ok(reconstructor.finish_with_outcome(succeeded))
    }
}

/// Executes the transaction described by `env` on top of `db` without committing it.
pub fn collect_steps<DB>(db: DB, env: EnvWithHandlerCfg) -> Result<CollectedTrace>
where
    DB: Database,
    DB::Error: std::error::Error,
{
    let root = RootCall {
        sender: env.tx.caller,
        receiver: match env.tx.transact_to {
            TxKind::Call(address) => Some(address),
            TxKind::Create => None,
        },
        input: env.tx.data.clone(),
    };

    let mut collector = StepCollector::new();
    let mut evm = new_evm_with_inspector(db, env, &mut collector);
    let result = evm.transact().map_err(|err| eyre!("failed to transact: {}", err))?.result;
    drop(evm);

    debug!(steps = collector.steps.len(), accounts = collector.codes.len(), "collected steps");
    Ok(CollectedTrace { root, steps: collector.steps, codes: collector.codes, result })
}

trait AssertionUnwrap<T> {
    fn assert_unwrap(self, msg: &str) -> T;
}

impl<T> AssertionUnwrap<T> for Option<T>
where
    T: Default,
{
    fn assert_unwrap(self, msg: &str) -> T {
        match self {
            Some(value) => value,
            None => {
                debug_assert!(false, "{msg}");
                T::default()
            }
        }
    }
}
