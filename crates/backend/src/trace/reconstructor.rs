//! The step-by-step reconstruction state machine.

use std::sync::Arc;

use alloy_primitives::{Address, Bytes, U256};
use eyre::{bail, ensure, eyre, OptionExt, Result};
use revm::interpreter::opcode::{
    CALL, CALLCODE, CREATE, CREATE2, DELEGATECALL, JUMP, JUMPDEST, KECCAK256, RETURN,
    SELFDESTRUCT, STATICCALL, STOP,
};
use rustc_hash::FxHashSet;

use super::{
    entry::{self, EventDesc},
    frame::{
        current_external, pop_external, ExternalFrame, ExternalKind, Frame, FrameStack,
        InternalFrame,
    },
    preimage::PreimageIndex,
    CodeSource, RawStep, ReturnDesc, RootCall, Trace, TraceStep,
};
use crate::{
    analysis::{matcher::BytecodeMatcher, source_map::JumpKind},
    artifact::{ast::NodeRef, types::TypeConverter, ArtifactIndex},
    config::DebuggerConfig,
    decode::{stack::peek, Limits},
    utils::{
        bytes::read_slice_padded,
        opcode::{is_depth_increasing_opcode, log_topics},
    },
};

/// Turns raw VM steps into [`TraceStep`]s, one at a time and strictly in order.
///
/// Each step is derived from the previous one plus the accumulated preimages and account
/// sets; independent traces need independent reconstructors.
pub struct TraceReconstructor<'a, C> {
    matcher: &'a BytecodeMatcher,
    converter: TypeConverter,
    code_source: C,
    root: RootCall,
    config: DebuggerConfig,
    limits: Limits,
    steps: Vec<TraceStep>,
    preimages: PreimageIndex,
    live_contracts: FxHashSet<Address>,
    destroyed: FxHashSet<Address>,
}

impl<'a, C: CodeSource> TraceReconstructor<'a, C> {
    pub fn new(
        index: &ArtifactIndex,
        matcher: &'a BytecodeMatcher,
        code_source: C,
        root: RootCall,
        config: DebuggerConfig,
    ) -> Self {
        Self {
            matcher,
            converter: *index.converter(),
            code_source,
            root,
            limits: Limits::from(&config),
            config,
            steps: vec![],
            preimages: PreimageIndex::default(),
            live_contracts: FxHashSet::default(),
            destroyed: FxHashSet::default(),
        }
    }

    /// Steps processed so far.
    pub fn steps(&self) -> &[TraceStep] {
        &self.steps
    }

    pub fn preimages(&self) -> &PreimageIndex {
        &self.preimages
    }

    /// Reconstructs the next step.
    ///
    /// Fails when the raw trace breaks the call protocol: a depth change without a call or
    /// creation, a depth jump by more than one, a return from more frames than are open, or,
    /// in strict mode, an internal return outside of an internal frame.
    pub fn process(&mut self, raw: RawStep) -> Result<&TraceStep> {
        let index = self.steps.len();

        let max_len = self.limits.max_bytes_length;
        if let Some((input, output)) =
            self.steps.last().and_then(|prev| hashed(prev, &raw, max_len))
        {
            trace!(step = index, hash = %output, len = input.len(), "observed keccak preimage");
            self.preimages.record(input, output);
        }

        let step = self.annotate(raw, index)?;

        // A creation only counts once its code is deposited.
        if let Some(frame) = step.external_frame().filter(|frame| !frame.is_creation()) {
            if !self.destroyed.contains(&frame.address) {
                self.live_contracts.insert(frame.address);
            }
        }
        if let Some(address) = step.created {
            if !self.destroyed.contains(&address) {
                self.live_contracts.insert(address);
            }
        }
        if let Some(address) = step.destroyed {
            self.live_contracts.remove(&address);
            self.destroyed.insert(address);
        }

        self.steps.push(step);
        Ok(&self.steps[index])
    }

    /// Ends the reconstruction.
    ///
    /// The outcome of the transaction is not part of the step stream, so a top-level creation
    /// is left unmarked; see [`finish_with_outcome`](Self::finish_with_outcome).
    pub fn finish(self) -> Trace {
        debug!(
            steps = self.steps.len(),
            preimages = self.preimages.len(),
            live = self.live_contracts.len(),
            destroyed = self.destroyed.len(),
            "finished trace reconstruction"
        );
        Trace {
            steps: self.steps,
            preimages: self.preimages,
            live_contracts: self.live_contracts,
            destroyed: self.destroyed,
            converter: self.converter,
            limits: self.limits,
        }
    }

    /// Ends the reconstruction of a transaction that `succeeded` or not, marking a top-level
    /// creation that returned as created.
    pub fn finish_with_outcome(mut self, succeeded: bool) -> Trace {
        if succeeded && self.root.receiver.is_none() {
            if let Some(step) = self.steps.last_mut() {
                let root = step
                    .external_frame()
                    .filter(|frame| frame.start_step == 0 && frame.is_creation())
                    .filter(|_| matches!(step.raw.op, RETURN | STOP))
                    .map(|frame| frame.address);
                if let Some(address) = root {
                    step.created = Some(address);
                    if !self.destroyed.contains(&address) {
                        self.live_contracts.insert(address);
                    }
                }
            }
        }
        self.finish()
    }

    fn annotate(&self, raw: RawStep, index: usize) -> Result<TraceStep> {
        let prev = self.steps.last();
        let mut frames = match prev {
            None => Arc::new(vec![Frame::External(Arc::new(self.root_frame(&raw)))]),
            Some(prev) => self.external_transition(prev, &raw, index)?,
        };

        let external = current_external(&frames).cloned();
        let contract = external.as_ref().and_then(|frame| frame.contract.clone());
        let is_creation = external.as_ref().is_some_and(|frame| frame.is_creation());

        let source = contract.as_ref().and_then(|record| record.source_entry(raw.pc, is_creation));
        let node = source
            .and_then(|entry| entry.range)
            .zip(contract.as_ref())
            .and_then(|(range, record)| record.node_at(&range, is_creation));

        let mut flagged = false;
        let mut returns = None;
        if let (Some(parent), Some(entry), true) =
            (&external, source, self.config.resolve_internal_frames)
        {
            if raw.op == JUMPDEST {
                // The previous step must have run in the same external frame.
                let jumped_in = prev.is_some_and(|prev| {
                    prev.raw.op == JUMP &&
                        prev.source.is_some_and(|entry| entry.jump == JumpKind::Into) &&
                        prev.external_frame().is_some_and(|frame| Arc::ptr_eq(frame, parent))
                });
                let callable = node.clone().filter(NodeRef::is_callable);
                let innermost = frames.last().and_then(Frame::callee);
                let fell_in = callable.as_ref().is_some_and(|callee| Some(callee) != innermost);

                if jumped_in || fell_in {
                    let arguments = callable
                        .as_ref()
                        .map(|callee| entry::internal_arguments(callee, &self.converter))
                        .unwrap_or_default();
                    trace!(step = index, pc = raw.pc, callee = ?callable, "entered internal frame");
                    Arc::make_mut(&mut frames).push(Frame::Internal(Arc::new(InternalFrame {
                        parent: Arc::clone(parent),
                        callee: callable,
                        offset: raw.pc,
                        start_step: index,
                        arguments,
                    })));
                }
            } else if raw.op == JUMP && entry.jump == JumpKind::Out {
                match frames.last().cloned() {
                    Some(Frame::Internal(frame)) => {
                        returns = frame.callee.clone().map(|callee| ReturnDesc::Internal {
                            values: entry::internal_returns(&callee, &self.converter),
                            callee,
                        });
                        trace!(step = index, pc = raw.pc, "left internal frame");
                        Arc::make_mut(&mut frames).pop();
                    }
                    _ if self.config.strict => {
                        bail!(
                            "internal return at step {index} (pc {}) outside of an internal frame",
                            raw.pc
                        )
                    }
                    _ => {
                        warn!(
                            step = index,
                            pc = raw.pc,
                            "internal return outside of an internal frame"
                        );
                        flagged = true;
                    }
                }
            }
        }

        let event = log_topics(raw.op).and_then(|count| self.event(&raw, count, &external));

        let created = prev.and_then(|prev| returned_creation(prev, &raw));
        let mut destroyed = None;
        match raw.op {
            RETURN => {
                if let Some(frame) = external.as_ref().filter(|frame| !frame.is_creation()) {
                    let data = peek(&raw.stack, 0)
                        .zip(peek(&raw.stack, 1))
                        .and_then(|(offset, size)| {
                            read_slice_padded(&raw.memory, offset, size, self.limits.max_bytes_length)
                        })
                        .map(Bytes::from)
                        .unwrap_or_default();
                    let values = frame
                        .callee
                        .as_ref()
                        .map(|callee| entry::external_returns(callee, &self.converter))
                        .unwrap_or_default();
                    returns =
                        Some(ReturnDesc::External { callee: frame.callee.clone(), data, values });
                }
            }
            SELFDESTRUCT => destroyed = Some(raw.address),
            _ => {}
        }

        Ok(TraceStep {
            index,
            raw,
            frames,
            source,
            node,
            event,
            returns,
            created,
            destroyed,
            flagged,
        })
    }

    /// Frame stack after a change in call depth between `prev` and `raw`.
    fn external_transition(
        &self,
        prev: &TraceStep,
        raw: &RawStep,
        index: usize,
    ) -> Result<FrameStack> {
        let (from, to) = (prev.raw.depth, raw.depth);

        if to == from {
            return Ok(Arc::clone(&prev.frames));
        }

        if to > from {
            ensure!(to == from + 1, "call depth jumped from {from} to {to} at step {index}");
            ensure!(
                is_depth_increasing_opcode(prev.raw.op),
                "call depth increased after {} at step {index}",
                prev.raw.opcode_name()
            );
            let parent = prev.external_frame().ok_or_eyre("call made outside of any frame")?;
            let frame = self.called_frame(prev, parent, raw, index)?;
            let mut frames = prev.frames.to_vec();
            frames.push(Frame::External(Arc::new(frame)));
            return Ok(Arc::new(frames));
        }

        let count = from - to;
        let mut frames = prev.frames.to_vec();
        let popped = pop_external(&mut frames, count)
            .ok_or_else(|| eyre!("returned from {count} frames at step {index} with fewer open"))?;
        ensure!(!frames.is_empty(), "returned from the outermost frame at step {index}");
        trace!(step = index, count = popped.len(), "returned from external frames");
        Ok(Arc::new(frames))
    }

    fn root_frame(&self, raw: &RawStep) -> ExternalFrame {
        let kind = match self.root.receiver {
            Some(_) => ExternalKind::Call,
            None => ExternalKind::Creation,
        };
        self.external_frame(kind, self.root.sender, self.root.input.clone(), raw, 0)
    }

    /// The frame entered by the call or creation executed at `prev`.
    fn called_frame(
        &self,
        prev: &TraceStep,
        parent: &ExternalFrame,
        raw: &RawStep,
        index: usize,
    ) -> Result<ExternalFrame> {
        let stack = &prev.raw.stack;
        let arg = |i: usize| {
            peek(stack, i).ok_or_else(|| {
                eyre!("{} at step {} has too few stack items", prev.raw.opcode_name(), prev.index)
            })
        };
        let read = |offset: U256, size: U256| {
            read_slice_padded(&prev.raw.memory, offset, size, self.limits.max_bytes_length)
                .map(Bytes::from)
                .unwrap_or_else(|| {
                    let op = prev.raw.opcode_name();
                    warn!(step = prev.index, %size, "{op} input exceeds the bytes limit");
                    Bytes::new()
                })
        };

        // Stack layouts, top first:
        //   CREATE/CREATE2: value, offset, size[, salt]
        //   CALL/CALLCODE: gas, address, value, args offset, args size
        //   DELEGATECALL/STATICCALL: gas, address, args offset, args size
        let (kind, sender, input) = match prev.raw.op {
            CREATE | CREATE2 => (ExternalKind::Creation, parent.address, read(arg(1)?, arg(2)?)),
            CALL | CALLCODE => (ExternalKind::Call, parent.address, read(arg(3)?, arg(4)?)),
            DELEGATECALL => (ExternalKind::Call, parent.sender, read(arg(2)?, arg(3)?)),
            STATICCALL => (ExternalKind::Call, parent.address, read(arg(2)?, arg(3)?)),
            op => bail!("unexpected call opcode {op:#x}"),
        };

        Ok(self.external_frame(kind, sender, input, raw, index))
    }

    fn external_frame(
        &self,
        kind: ExternalKind,
        sender: Address,
        input: Bytes,
        raw: &RawStep,
        start_step: usize,
    ) -> ExternalFrame {
        let contract = match kind {
            ExternalKind::Creation => self.matcher.match_code(&input, true),
            ExternalKind::Call => self
                .code_source
                .code(&raw.code_address)
                .and_then(|code| self.matcher.match_code(&code, false)),
        };
        let callee = contract.as_ref().and_then(|record| match kind {
            ExternalKind::Creation => record.constructor().cloned(),
            ExternalKind::Call => record.entry_point(&input),
        });
        let arguments = match (&contract, &callee) {
            (Some(record), Some(callee)) => {
                entry::external_arguments(record, callee, &self.converter)
            }
            _ => vec![],
        };

        debug!(
            step = start_step,
            ?kind,
            address = ?raw.address,
            code_address = ?raw.code_address,
            contract = ?contract.as_ref().map(|record| record.name.as_str()),
            callee = ?callee.as_ref().and_then(NodeRef::name),
            "entered external frame"
        );

        ExternalFrame {
            kind,
            sender,
            input,
            address: raw.address,
            code_address: raw.code_address,
            depth: raw.depth,
            contract,
            callee,
            arguments,
            start_step,
        }
    }

    fn event(
        &self,
        raw: &RawStep,
        count: usize,
        external: &Option<Arc<ExternalFrame>>,
    ) -> Option<EventDesc> {
        let topics = entry::read_log_topics(&raw.stack, count)?;
        let size = peek(&raw.stack, 1)?;
        let max_len = self.limits.max_bytes_length;
        let data = read_slice_padded(&raw.memory, peek(&raw.stack, 0)?, size, max_len)
            .unwrap_or_else(|| {
                trace!(address = ?raw.address, %size, "log payload exceeds the bytes limit");
                Vec::new()
            });
        let mut event = EventDesc {
            address: raw.address,
            topics,
            data: data.into(),
            name: None,
            arguments: vec![],
        };
        if self.config.decode_events {
            if let Some(record) = external.as_ref().and_then(|frame| frame.contract.as_ref()) {
                event.resolve(record, &self.converter, &self.limits);
            }
        }
        Some(event)
    }
}

/// Preimage of the hash computed by `prev`, if it executed `KECCAK256`.
///
/// A hash that ran out of gas leaves its frame, so the next step must stay at the same depth
/// for its top word to be the digest.
fn hashed(prev: &TraceStep, raw: &RawStep, max_len: usize) -> Option<(Bytes, U256)> {
    if prev.raw.op != KECCAK256 || raw.depth != prev.raw.depth {
        return None;
    }
    let offset = peek(&prev.raw.stack, 0)?;
    let size = peek(&prev.raw.stack, 1)?;
    let input = read_slice_padded(&prev.raw.memory, offset, size, max_len)?;
    Some((input.into(), *raw.stack.last()?))
}

/// Address deployed by the creation frame `prev` returned from, when `raw` is the creator's
/// next step.
///
/// The creator resumes with the new address on top of its stack, or zero when depositing the
/// code failed.
fn returned_creation(prev: &TraceStep, raw: &RawStep) -> Option<Address> {
    if !matches!(prev.raw.op, RETURN | STOP) {
        return None;
    }
    let frame = prev.external_frame().filter(|frame| frame.is_creation())?;
    let resumed = raw.depth + 1 == frame.depth;
    (resumed && raw.stack.last().is_some_and(|word| !word.is_zero())).then_some(frame.address)
}

/// Reconstructs a whole trace.
pub fn reconstruct<C: CodeSource>(
    index: &ArtifactIndex,
    matcher: &BytecodeMatcher,
    code_source: C,
    root: RootCall,
    config: DebuggerConfig,
    steps: impl IntoIterator<Item = RawStep>,
) -> Result<Trace> {
    let mut reconstructor = TraceReconstructor::new(index, matcher, code_source, root, config);
    for raw in steps {
        reconstructor.process(raw)?;
    }
    Ok(reconstructor.finish())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use proptest::prelude::*;
    use revm::interpreter::opcode::{ADD, LOG0, MSTORE, POP, PUSH1};

    fn step(op: u8, depth: usize, stack: Vec<U256>) -> RawStep {
        RawStep {
            op,
            depth,
            stack,
            address: Address::with_last_byte(depth as u8),
            code_address: Address::with_last_byte(depth as u8),
            ..Default::default()
        }
    }

    fn root() -> RootCall {
        RootCall {
            sender: Address::repeat_byte(0xee),
            receiver: Some(Address::with_last_byte(1)),
            input: Bytes::new(),
        }
    }

    fn run(steps: Vec<RawStep>, config: DebuggerConfig) -> Result<Trace> {
        let index = ArtifactIndex::new(&config);
        let matcher = BytecodeMatcher::new(&index);
        let code: HashMap<Address, Bytes> = HashMap::new();
        reconstruct(&index, &matcher, code, root(), config, steps)
    }

    #[test]
    fn test_depth_requires_call_opcode() {
        let err = run(vec![step(ADD, 1, vec![]), step(PUSH1, 2, vec![])], DebuggerConfig::default())
            .unwrap_err();
        assert!(err.to_string().contains("call depth increased after ADD"), "{err}");

        let err = run(vec![step(CALL, 1, vec![U256::ZERO; 7]), step(PUSH1, 3, vec![])], DebuggerConfig::default())
            .unwrap_err();
        assert!(err.to_string().contains("jumped"), "{err}");
    }

    #[test]
    fn test_call_and_return_frames() {
        // STATICCALL(gas, addr, argsOffset = 0, argsSize = 4), memory holds the selector
        let mut call = step(STATICCALL, 1, vec![U256::from(4), U256::ZERO, U256::from(2), U256::from(1000)]);
        call.memory = Bytes::from(vec![0xde, 0xad, 0xbe, 0xef, 0x00]);
        let steps = vec![
            step(PUSH1, 1, vec![]),
            call,
            step(PUSH1, 2, vec![]),
            step(STOP, 2, vec![]),
            step(MSTORE, 1, vec![U256::from(1)]),
        ];
        let trace = run(steps, DebuggerConfig::default()).unwrap();

        let depths: Vec<_> = trace.steps.iter().map(|s| s.frames.len()).collect();
        assert_eq!(depths, vec![1, 1, 2, 2, 1]);

        let callee = trace.steps[2].external_frame().unwrap();
        assert_eq!(callee.kind, ExternalKind::Call);
        assert_eq!(callee.sender, Address::with_last_byte(1));
        assert_eq!(callee.input, Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(callee.start_step, 2);
        assert!(callee.contract.is_none());

        // unchanged depth shares the frame stack
        assert!(Arc::ptr_eq(&trace.steps[2].frames, &trace.steps[3].frames));
        assert!(trace.live_contracts.contains(&Address::with_last_byte(2)));
    }

    #[test]
    fn test_keccak_preimages_and_logs() {
        let mut hash = step(KECCAK256, 1, vec![U256::from(3), U256::ZERO]);
        hash.memory = Bytes::from_static(b"abc");
        let digest = U256::from_be_bytes(alloy_primitives::keccak256(b"abc").0);

        // LOG1(offset = 0, size = 2, topic0 = 7)
        let mut log = step(revm::interpreter::opcode::LOG1, 1, vec![U256::from(7), U256::from(2), U256::ZERO]);
        log.memory = Bytes::from_static(b"hi");

        let trace = run(vec![hash, step(PUSH1, 1, vec![digest]), log], DebuggerConfig::default())
            .unwrap();
        assert_eq!(trace.preimages.get(&digest), Some(&Bytes::from_static(b"abc")));

        let event = trace.steps[2].event.as_ref().unwrap();
        assert_eq!(event.topics, vec![alloy_primitives::B256::from(U256::from(7))]);
        assert_eq!(event.data, Bytes::from_static(b"hi"));
        assert_eq!(event.name, None);
    }

    #[test]
    fn test_selfdestruct_marks_destroyed() {
        let trace = run(
            vec![step(PUSH1, 1, vec![]), step(SELFDESTRUCT, 1, vec![U256::ZERO])],
            DebuggerConfig::default(),
        )
        .unwrap();
        assert_eq!(trace.steps[1].destroyed, Some(Address::with_last_byte(1)));
        assert!(trace.destroyed.contains(&Address::with_last_byte(1)));
        assert!(!trace.live_contracts.contains(&Address::with_last_byte(1)));
    }

    #[test]
    fn test_created_only_after_deposit() {
        let created = Address::with_last_byte(2);
        let run_creation = |result: U256| {
            // CREATE(value = 0, offset = 0, size = 1)
            let mut create = step(CREATE, 1, vec![U256::from(1), U256::ZERO, U256::ZERO]);
            create.memory = Bytes::from_static(&[0x00]);
            let steps = vec![
                step(PUSH1, 1, vec![]),
                create,
                step(PUSH1, 2, vec![]),
                step(RETURN, 2, vec![U256::ZERO, U256::ZERO]),
                step(POP, 1, vec![result]),
            ];
            run(steps, DebuggerConfig::default()).unwrap()
        };

        let trace = run_creation(U256::from_be_slice(created.as_slice()));
        assert_eq!(trace.steps[2].external_frame().unwrap().kind, ExternalKind::Creation);
        assert_eq!(trace.steps[3].created, None);
        assert_eq!(trace.steps[4].created, Some(created));
        assert!(trace.live_contracts.contains(&created));

        // a rejected deposit pushes zero
        let trace = run_creation(U256::ZERO);
        assert!(trace.steps.iter().all(|step| step.created.is_none()));
        assert!(!trace.live_contracts.contains(&created));
        assert!(trace.live_contracts.contains(&Address::with_last_byte(1)));
    }

    #[test]
    fn test_oversized_operands_are_not_read() {
        let huge = U256::from(1u64 << 63);
        let steps = vec![
            step(PUSH1, 1, vec![]),
            step(LOG0, 1, vec![huge, U256::ZERO]),
            step(KECCAK256, 1, vec![huge, U256::ZERO]),
            step(PUSH1, 1, vec![U256::from(1)]),
            step(RETURN, 1, vec![huge, U256::ZERO]),
        ];
        let trace = run(steps, DebuggerConfig::default()).unwrap();

        let event = trace.steps[1].event.as_ref().unwrap();
        assert!(event.topics.is_empty());
        assert!(event.data.is_empty());
        assert_eq!(trace.preimages.len(), 0);
        match &trace.steps[4].returns {
            Some(ReturnDesc::External { data, .. }) => assert!(data.is_empty()),
            other => panic!("unexpected return {other:?}"),
        }
    }

    #[test]
    fn test_keccak_leaving_the_frame_records_nothing() {
        let mut hash = step(KECCAK256, 2, vec![U256::from(3), U256::ZERO]);
        hash.memory = Bytes::from_static(b"abc");
        let steps = vec![
            step(PUSH1, 1, vec![]),
            step(CALL, 1, vec![U256::ZERO; 7]),
            hash,
            // the caller resumes with the failed call's zero on top
            step(POP, 1, vec![U256::ZERO]),
        ];
        let trace = run(steps, DebuggerConfig::default()).unwrap();
        assert_eq!(trace.preimages.len(), 0);
    }

    proptest! {
        #[test]
        fn external_frames_follow_depth(moves in prop::collection::vec(any::<bool>(), 0..40)) {
            let mut steps = vec![step(PUSH1, 1, vec![])];
            let mut depth = 1;
            for enter in moves {
                if enter {
                    steps.push(step(CALL, depth, vec![U256::ZERO; 7]));
                    depth += 1;
                } else if depth > 1 {
                    depth -= 1;
                }
                steps.push(step(PUSH1, depth, vec![]));
            }

            let trace = run(steps, DebuggerConfig::default()).unwrap();
            for step in &trace.steps {
                let external = step.frames.iter().filter(|frame| !frame.is_internal()).count();
                prop_assert_eq!(external, step.raw.depth);
            }
        }
    }
}
