pub mod ai;
pub mod conversation;
pub mod flow;
pub mod messaging;
