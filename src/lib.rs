//! Fine-grained reactive runtime paired with a splice-minimal child-list
//! reconciler.
//!
//! State lives in [`Source`] cells; computations ([`Memo`], [`observe`],
//! [`render_effect`], [`after_effect`]) track the cells they read and are
//! re-run by the [`Runtime`]'s fixed-phase scheduler with the minimum number
//! of recomputations. List state projects through [`map_keyed`] /
//! [`map_indexed`] into stable entry sets, and [`reconcile`] applies a node
//! list to an external parent with the minimum viable sequence of
//! insert/remove/replace mutations.

mod asynx;
mod clock;
mod core;
mod effects;
mod list;
mod memo;
mod owner;
mod reconcile;
mod source;
mod suspense;
mod utils;

pub use asynx::{
    AsynxHandle, AsynxSource, Pipeline, Produced, Sched, asynx, await_asynx, suspending_asynx,
};
pub use clock::{ClockHandle, ClockTask, HostClock, ManualClock};
pub use self::core::{
    CircularError, Equal, HostError, RunawayError, Runtime, Scope, Step, UnownedDisposalError,
    batch,
};
pub use effects::{
    Selector, after_effect, asynx_after_effect, asynx_observe, asynx_render_effect, observe,
    on_mount, render_effect, restrict_to, selector,
};
pub use list::{MapOptions, map_indexed, map_keyed};
pub use memo::Memo;
pub use owner::{
    AppContext, ContextKey, Disposer, OwnerHandle, app_context_key, app_root, app_root_with,
    remount, remountable_root, root,
};
pub use reconcile::{NodeSink, SinkOps, VecSink, reconcile};
pub use source::{LockHandle, ReadSource, Source, WriteSource, signal_pair};
pub use suspense::{suspense, suspense_error};

#[cfg(test)]
mod test_helpers;
