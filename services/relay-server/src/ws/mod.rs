//! The five upgrade handlers of §6, one per role, plus the route table's
//! entry points. Each module owns exactly one role's read loop; shared
//! framing helpers live in `crate::ws_common`.

pub mod bulk;
pub mod dashboard;
pub mod listener;
pub mod orientation;
pub mod sender;
