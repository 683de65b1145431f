//! Position lifecycle - state machine and the actor driving it

pub mod actor;
pub mod state_machine;

pub use actor::PositionActor;
pub use state_machine::{
    PositionHandlers, PositionKey, PositionState, PositionStateMachine, TransitionHandler,
    transition,
};
