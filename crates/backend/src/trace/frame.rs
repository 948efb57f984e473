//! Call frames: external message calls and internal function invocations.

use std::sync::Arc;

use alloy_primitives::{Address, Bytes};
use serde::{Deserialize, Serialize};

use crate::{
    artifact::{ast::NodeRef, contract::ContractRecord},
    decode::DataView,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExternalKind {
    Call,
    Creation,
}

/// A message call or contract creation.
#[derive(Clone, Debug)]
pub struct ExternalFrame {
    pub kind: ExternalKind,
    /// `msg.sender` inside the frame.
    pub sender: Address,
    /// Call data, or the init code (with constructor arguments) of a creation.
    pub input: Bytes,
    /// Account whose storage the frame executes against.
    pub address: Address,
    /// Account whose code runs. Differs from `address` under `DELEGATECALL`/`CALLCODE`.
    pub code_address: Address,
    /// Call depth reported by the engine.
    pub depth: usize,
    pub contract: Option<Arc<ContractRecord>>,
    /// Dispatched function, getter, fallback, receive or constructor.
    pub callee: Option<NodeRef>,
    /// Views into `input`.
    pub arguments: Vec<DataView>,
    pub start_step: usize,
}

impl ExternalFrame {
    pub fn is_creation(&self) -> bool {
        self.kind == ExternalKind::Creation
    }
}

/// An internal function invocation inside an external frame.
#[derive(Clone, Debug)]
pub struct InternalFrame {
    pub parent: Arc<ExternalFrame>,
    /// `None` when the jump could not be tied to a declaration.
    pub callee: Option<NodeRef>,
    /// Program counter of the entered `JUMPDEST`.
    pub offset: usize,
    pub start_step: usize,
    /// Stack views, valid at `start_step`.
    pub arguments: Vec<DataView>,
}

#[derive(Clone, Debug)]
pub enum Frame {
    External(Arc<ExternalFrame>),
    Internal(Arc<InternalFrame>),
}

impl Frame {
    /// The external frame this frame executes in.
    pub fn external(&self) -> &Arc<ExternalFrame> {
        match self {
            Self::External(frame) => frame,
            Self::Internal(frame) => &frame.parent,
        }
    }

    pub fn callee(&self) -> Option<&NodeRef> {
        match self {
            Self::External(frame) => frame.callee.as_ref(),
            Self::Internal(frame) => frame.callee.as_ref(),
        }
    }

    pub fn start_step(&self) -> usize {
        match self {
            Self::External(frame) => frame.start_step,
            Self::Internal(frame) => frame.start_step,
        }
    }

    pub fn arguments(&self) -> &[DataView] {
        match self {
            Self::External(frame) => &frame.arguments,
            Self::Internal(frame) => &frame.arguments,
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

/// A persistent stack of frames, innermost last. Steps that do not change the stack share it.
pub type FrameStack = Arc<Vec<Frame>>;

/// The innermost external frame of `frames`.
pub fn current_external(frames: &[Frame]) -> Option<&Arc<ExternalFrame>> {
    frames.last().map(Frame::external)
}

/// Pops frames until `count` external frames are gone. Returns the popped external frames,
/// innermost first, or `None` when the stack holds fewer than `count`.
pub fn pop_external(frames: &mut Vec<Frame>, count: usize) -> Option<Vec<Arc<ExternalFrame>>> {
    let mut popped = Vec::with_capacity(count);
    while popped.len() < count {
        match frames.pop()? {
            Frame::External(frame) => popped.push(frame),
            Frame::Internal(_) => {}
        }
    }
    Some(popped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn external(depth: usize) -> Arc<ExternalFrame> {
        Arc::new(ExternalFrame {
            kind: ExternalKind::Call,
            sender: Address::ZERO,
            input: Bytes::new(),
            address: Address::with_last_byte(depth as u8),
            code_address: Address::with_last_byte(depth as u8),
            depth,
            contract: None,
            callee: None,
            arguments: vec![],
            start_step: depth,
        })
    }

    fn internal(parent: &Arc<ExternalFrame>) -> Frame {
        Frame::Internal(Arc::new(InternalFrame {
            parent: Arc::clone(parent),
            callee: None,
            offset: 0,
            start_step: 0,
            arguments: vec![],
        }))
    }

    #[test]
    fn test_pop_skips_internal_frames() {
        let a = external(1);
        let b = external(2);
        let mut frames = vec![
            Frame::External(Arc::clone(&a)),
            internal(&a),
            Frame::External(Arc::clone(&b)),
            internal(&b),
            internal(&b),
        ];
        assert_eq!(current_external(&frames).map(|f| f.depth), Some(2));

        let popped = pop_external(&mut frames, 1).unwrap();
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].depth, 2);
        assert_eq!(frames.len(), 2);
        assert!(frames[1].is_internal());
        assert_eq!(frames[1].external().depth, 1);

        assert!(pop_external(&mut frames, 2).is_none());
    }
}
