use std::sync::Arc;

use alloy_primitives::{Address, Bytes};
use revm::{
    interpreter::{CallInputs, CallOutcome, CreateInputs, CreateOutcome, Interpreter},
    Database, EvmContext, Inspector,
};
use rustc_hash::FxHashMap;

use crate::{
    decode::StorageDump,
    trace::RawStep,
    utils::opcode::{is_memory_modifying_opcode, is_storage_modifying_opcode},
};

use super::AssertionUnwrap;

/// Records every executed instruction as a [`RawStep`], along with the runtime code of every
/// account that was called.
///
/// Memory and storage snapshots are shared with the previous step when the previous
/// instruction ran in the same frame and could not have changed them.
#[derive(Debug, Default)]
pub struct StepCollector {
    pub steps: Vec<RawStep>,
    /// Runtime code by code address.
    pub codes: FxHashMap<Address, Bytes>,
    /// Code address of each open frame, and whether it is a creation.
    frames: Vec<(Address, bool)>,
}

impl StepCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn enter(&mut self, code_address: Address, is_creation: bool) {
        self.frames.push((code_address, is_creation));
    }

    fn exit(&mut self) {
        self.frames.pop().assert_unwrap("frame exit without a matching entry");
    }
}

impl<DB> Inspector<DB> for StepCollector
where
    DB: Database,
    DB::Error: std::error::Error,
{
    fn step(&mut self, interp: &mut Interpreter, ecx: &mut EvmContext<DB>) {
        let op = interp.current_opcode();
        let depth = ecx.journaled_state.depth() as usize;
        let address = interp.contract.target_address;
        let (code_address, is_creation) = self.frames.last().copied().unwrap_or((address, false));
        let prev = self.steps.last();

        if !is_creation && prev.map_or(true, |step| step.depth != depth) {
            self.codes
                .entry(code_address)
                .or_insert_with(|| interp.contract.bytecode.original_bytes());
        }

        let memory = prev
            .filter(|step| step.depth == depth && !is_memory_modifying_opcode(step.op))
            .map(|step| step.memory.clone())
            .unwrap_or_else(|| interp.shared_memory.context_memory().to_vec().into());

        let storage = prev
            .filter(|step| {
                // Returning from a frame may roll back its writes.
                step.depth == depth &&
                    step.address == address &&
                    !is_storage_modifying_opcode(step.op)
            })
            .map(|step| Arc::clone(&step.storage))
            .unwrap_or_else(|| {
                let dump: StorageDump = ecx
                    .journaled_state
                    .state
                    .get(&address)
                    .map(|account| {
                        account.storage.iter().map(|(k, v)| (*k, v.present_value)).collect()
                    })
                    .unwrap_or_default();
                Arc::new(dump)
            });

        self.steps.push(RawStep {
            op,
            pc: interp.program_counter(),
            depth,
            stack: interp.stack().data().clone(),
            memory,
            storage,
            address,
            code_address,
            gas: interp.gas.remaining(),
            gas_cost: 0,
        });
    }

    fn step_end(&mut self, interp: &mut Interpreter, _ecx: &mut EvmContext<DB>) {
        if let Some(step) = self.steps.last_mut() {
            step.gas_cost = step.gas.saturating_sub(interp.gas.remaining());
        }
    }

    fn call(&mut self, _ecx: &mut EvmContext<DB>, inputs: &mut CallInputs) -> Option<CallOutcome> {
        self.enter(inputs.bytecode_address, false);
        None
    }

    fn call_end(
        &mut self,
        _ecx: &mut EvmContext<DB>,
        _inputs: &CallInputs,
        outcome: CallOutcome,
    ) -> CallOutcome {
        self.exit();
        outcome
    }

    fn create(
        &mut self,
        ecx: &mut EvmContext<DB>,
        inputs: &mut CreateInputs,
    ) -> Option<CreateOutcome> {
        if let Err(err) = ecx.load_account(inputs.caller) {
            warn!(caller = ?inputs.caller, %err, "failed to load creator account");
            self.enter(Address::ZERO, true);
            return None;
        }
        // Init code runs at the address being created.
        let nonce = ecx.journaled_state.account(inputs.caller).info.nonce;
        self.enter(inputs.created_address(nonce), true);
        None
    }

    fn create_end(
        &mut self,
        _ecx: &mut EvmContext<DB>,
        _inputs: &CreateInputs,
        outcome: CreateOutcome,
    ) -> CreateOutcome {
        self.exit();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{TxKind, U256};
    use revm::{
        db::{CacheDB, EmptyDB},
        interpreter::opcode::{
            CALL, DELEGATECALL, GAS, MSTORE, POP, PUSH1, REVERT, SLOAD, SSTORE, STOP,
        },
        primitives::{AccountInfo, Bytecode, EnvWithHandlerCfg, SpecId},
    };

    use crate::utils::evm::new_evm_with_inspector;

    fn account(db: &mut CacheDB<EmptyDB>, address: Address, code: &[u8]) {
        let code = Bytecode::new_raw(Bytes::copy_from_slice(code));
        db.insert_account_info(address, AccountInfo::from_bytecode(code));
    }

    #[test]
    fn test_collects_nested_calls() {
        let caller = Address::repeat_byte(0xee);
        let outer = Address::with_last_byte(0xa);
        let inner = Address::with_last_byte(0xb);

        let mut db = CacheDB::new(EmptyDB::default());
        // SSTORE(0, 1); MSTORE(0, 7); CALL(gas, inner, 0, 0, 0, 0, 0); STOP
        #[rustfmt::skip]
        let outer_code = [
            PUSH1, 1, PUSH1, 0, SSTORE,
            PUSH1, 7, PUSH1, 0, MSTORE,
            PUSH1, 0, PUSH1, 0, PUSH1, 0, PUSH1, 0, PUSH1, 0, PUSH1, 0xb, GAS, CALL,
            STOP,
        ];
        account(&mut db, outer, &outer_code);
        account(&mut db, inner, &[PUSH1, 0, SLOAD, STOP]);

        let mut env = EnvWithHandlerCfg::new_with_spec_id(Default::default(), SpecId::CANCUN);
        env.tx.caller = caller;
        env.tx.transact_to = TxKind::Call(outer);
        env.tx.gas_limit = 1_000_000;

        let mut collector = StepCollector::new();
        let mut evm = new_evm_with_inspector(&mut db, env, &mut collector);
        evm.transact().unwrap();
        drop(evm);

        let steps = &collector.steps;
        let depths: Vec<_> = steps.iter().map(|s| s.depth).collect();
        assert_eq!(depths.iter().filter(|d| **d == 2).count(), 3);
        assert_eq!(*depths.first().unwrap(), 1);
        assert_eq!(*depths.last().unwrap(), 1);

        let call = steps.iter().position(|s| s.op == CALL).unwrap();
        assert_eq!(steps[call + 1].address, inner);
        assert_eq!(steps[call + 1].code_address, inner);
        assert_eq!(steps[call].stack.len(), 7);
        assert!(steps[call].gas_cost > 0);

        // storage written by SSTORE is visible from the following step on
        let sstore = steps.iter().position(|s| s.op == SSTORE).unwrap();
        assert!(steps[sstore].storage.is_empty());
        assert_eq!(steps[sstore + 1].storage.get(&U256::ZERO), Some(&U256::from(1)));

        // snapshots are shared until an instruction may write to them
        assert!(Arc::ptr_eq(&steps[1].storage, &steps[2].storage));
        let mstore = steps.iter().position(|s| s.op == MSTORE).unwrap();
        assert!(steps[mstore].memory.is_empty());
        assert_eq!(steps[mstore + 1].memory[31], 7);

        assert_eq!(collector.codes.get(&outer).map(|c| c.len()), Some(outer_code.len()));
        assert_eq!(collector.codes.get(&inner).map(|c| c.len()), Some(4));
        assert!(collector.frames.is_empty());
    }

    #[test]
    fn test_reverted_delegate_writes_are_not_shared() {
        let caller = Address::repeat_byte(0xee);
        let outer = Address::with_last_byte(0xa);
        let library = Address::with_last_byte(0xb);

        let mut db = CacheDB::new(EmptyDB::default());
        // DELEGATECALL(gas, library, 0, 0, 0, 0); POP; STOP
        #[rustfmt::skip]
        let outer_code = [
            PUSH1, 0, PUSH1, 0, PUSH1, 0, PUSH1, 0, PUSH1, 0xb, GAS, DELEGATECALL,
            POP, STOP,
        ];
        account(&mut db, outer, &outer_code);
        // SSTORE(0, 1); REVERT(0, 0)
        account(&mut db, library, &[PUSH1, 1, PUSH1, 0, SSTORE, PUSH1, 0, PUSH1, 0, REVERT]);

        let mut env = EnvWithHandlerCfg::new_with_spec_id(Default::default(), SpecId::CANCUN);
        env.tx.caller = caller;
        env.tx.transact_to = TxKind::Call(outer);
        env.tx.gas_limit = 1_000_000;

        let mut collector = StepCollector::new();
        let mut evm = new_evm_with_inspector(&mut db, env, &mut collector);
        evm.transact().unwrap();
        drop(evm);

        let steps = &collector.steps;
        let revert = steps.iter().position(|s| s.op == REVERT).unwrap();
        assert_eq!(steps[revert].address, outer);
        assert_eq!(steps[revert].code_address, library);
        assert_eq!(steps[revert].storage.get(&U256::ZERO), Some(&U256::from(1)));

        let pop = &steps[revert + 1];
        assert_eq!((pop.op, pop.depth), (POP, 1));
        assert!(!Arc::ptr_eq(&steps[revert].storage, &pop.storage));
        assert!(pop.storage.get(&U256::ZERO).map_or(true, |value| value.is_zero()));
    }
}
