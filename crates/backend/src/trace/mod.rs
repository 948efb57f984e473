//! Reconstruction of source-level execution traces from raw VM steps.

pub mod entry;
pub mod frame;
pub mod preimage;
pub mod reconstructor;

use std::{collections::HashMap, hash::BuildHasher, sync::Arc};

use alloy_primitives::{Address, Bytes, U256};
use revm::interpreter::OpCode;
use rustc_hash::FxHashSet;

use self::{
    entry::EventDesc,
    frame::{ExternalFrame, Frame, FrameStack},
    preimage::{MapKeyIndex, PreimageIndex},
};
use crate::{
    analysis::source_map::SourceEntry,
    artifact::{ast::NodeRef, contract::ContractRecord, types::TypeConverter},
    decode::{
        state::{decode_contract_state, StateVariable},
        DataView, DecodeContext, Limits, StorageContext, StorageDump, Value,
    },
};

pub use self::reconstructor::{reconstruct, TraceReconstructor};

/// One step as reported by the execution engine.
#[derive(Clone, Debug, Default)]
pub struct RawStep {
    pub op: u8,
    pub pc: usize,
    /// Call depth. Only changes between consecutive steps are meaningful.
    pub depth: usize,
    /// Operand stack, top at the end.
    pub stack: Vec<U256>,
    pub memory: Bytes,
    /// Storage of the executing account.
    pub storage: Arc<StorageDump>,
    pub address: Address,
    pub code_address: Address,
    pub gas: u64,
    pub gas_cost: u64,
}

impl RawStep {
    pub fn opcode_name(&self) -> &'static str {
        OpCode::new(self.op).map(|op| op.as_str()).unwrap_or("UNKNOWN")
    }
}

/// The transaction's outermost call.
#[derive(Clone, Debug)]
pub struct RootCall {
    pub sender: Address,
    /// `None` for a contract creation.
    pub receiver: Option<Address>,
    /// Call data, or init code for a creation.
    pub input: Bytes,
}

/// Deployed code lookup for accounts entered during the trace.
pub trait CodeSource {
    fn code(&self, address: &Address) -> Option<Bytes>;
}

impl<S: BuildHasher> CodeSource for HashMap<Address, Bytes, S> {
    fn code(&self, address: &Address) -> Option<Bytes> {
        self.get(address).cloned()
    }
}

/// Values produced when a frame returns.
#[derive(Clone, Debug)]
pub enum ReturnDesc {
    /// An internal function's returning jump. Views are valid at this step.
    Internal { callee: NodeRef, values: Vec<DataView> },
    /// A `RETURN` out of an external frame. Views address `data`.
    External { callee: Option<NodeRef>, data: Bytes, values: Vec<DataView> },
}

/// A raw step with everything reconstructed around it.
#[derive(Clone, Debug)]
pub struct TraceStep {
    pub index: usize,
    pub raw: RawStep,
    /// Frames active at this step, innermost last.
    pub frames: FrameStack,
    /// Source map entry of the current instruction.
    pub source: Option<SourceEntry>,
    /// Outermost AST node spanning the source range.
    pub node: Option<NodeRef>,
    pub event: Option<EventDesc>,
    pub returns: Option<ReturnDesc>,
    /// Address whose creation is confirmed at this step: the creator's first step after the
    /// code was deposited, or the last step of a successful top-level creation.
    pub created: Option<Address>,
    /// Address that self-destructed at this step.
    pub destroyed: Option<Address>,
    /// An internal return did not match an internal frame and was tolerated.
    pub flagged: bool,
}

impl TraceStep {
    pub fn current_frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn external_frame(&self) -> Option<&Arc<ExternalFrame>> {
        frame::current_external(&self.frames)
    }

    pub fn contract(&self) -> Option<&Arc<ContractRecord>> {
        self.external_frame()?.contract.as_ref()
    }

    /// Decoding context over this step's machine state, with the current call data as the ABI
    /// space.
    pub fn decode_context<'a>(
        &'a self,
        map_keys: Option<&'a MapKeyIndex>,
        limits: Limits,
    ) -> DecodeContext<'a> {
        DecodeContext {
            stack: &self.raw.stack,
            memory: &self.raw.memory,
            calldata: self.external_frame().map(|frame| &frame.input[..]).unwrap_or_default(),
            storage: &self.raw.storage,
            map_keys,
            limits,
        }
    }
}

/// A reconstructed trace and the accumulators built while replaying it.
#[derive(Debug)]
pub struct Trace {
    pub steps: Vec<TraceStep>,
    pub preimages: PreimageIndex,
    /// Accounts that ran code or were created, and were not destroyed.
    pub live_contracts: FxHashSet<Address>,
    pub destroyed: FxHashSet<Address>,
    converter: TypeConverter,
    limits: Limits,
}

impl Trace {
    /// Mapping keys observed over the whole trace.
    pub fn map_keys(&self) -> MapKeyIndex {
        MapKeyIndex::build(&self.preimages)
    }

    /// Decodes the arguments of `frame` against the step that entered it.
    pub fn frame_arguments(
        &self,
        frame: &Frame,
        map_keys: Option<&MapKeyIndex>,
    ) -> Vec<(String, Option<Value>)> {
        let Some(step) = self.steps.get(frame.start_step()) else { return vec![] };
        let ctx = step.decode_context(map_keys, self.limits).with_calldata(&frame.external().input);
        frame.arguments().iter().map(|view| (view.name.clone(), view.decode(&ctx))).collect()
    }

    /// Decodes the values returned at `step`, if it returns from a frame.
    pub fn return_values(
        &self,
        step: &TraceStep,
        map_keys: Option<&MapKeyIndex>,
    ) -> Vec<(String, Option<Value>)> {
        let ctx = step.decode_context(map_keys, self.limits);
        let (values, ctx) = match &step.returns {
            Some(ReturnDesc::Internal { values, .. }) => (values, ctx),
            Some(ReturnDesc::External { values, data, .. }) => (values, ctx.with_calldata(data)),
            None => return vec![],
        };
        values.iter().map(|view| (view.name.clone(), view.decode(&ctx))).collect()
    }

    /// Decodes the state variables of `record` deployed at `address`, as of step `step`.
    ///
    /// Storage is taken from the latest step up to `step` that executed against `address`;
    /// an account that never ran reads as empty.
    pub fn decode_state(
        &self,
        record: &ContractRecord,
        address: Address,
        step: usize,
    ) -> Vec<StateVariable> {
        let empty = StorageDump::default();
        let storage = self
            .steps
            .iter()
            .take(step.saturating_add(1))
            .rev()
            .find(|s| s.raw.address == address)
            .map(|s| &*s.raw.storage)
            .unwrap_or(&empty);
        let map_keys = self.map_keys();
        let ctx = StorageContext { storage, map_keys: Some(&map_keys), limits: self.limits };
        decode_contract_state(record, &self.converter, &ctx)
    }
}
