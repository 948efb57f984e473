//! Utils

use revm::{
    inspector_handle_register, primitives::EnvWithHandlerCfg, Context, Database, Evm, EvmContext,
    Handler, Inspector,
};

/// Creates a new EVM with the given inspector.
#[inline]
pub fn new_evm_with_inspector<'a, DB, I>(
    db: DB,
    env: EnvWithHandlerCfg,
    inspector: I,
) -> Evm<'a, I, DB>
where
    DB: Database,
    I: Inspector<DB>,
{
    let EnvWithHandlerCfg { env, handler_cfg } = env;

    let context = Context::new(EvmContext::new_with_env(db, env), inspector);
    let mut handler = Handler::new(handler_cfg);
    handler.append_handler_register_plain(inspector_handle_register);
    Evm::new(context, handler)
}
