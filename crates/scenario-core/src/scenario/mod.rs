//! Scenario orchestration: membership lists, the assembler that fills them,
//! and the session that serializes edits to one study.

pub mod assembler;
pub mod membership;
pub mod session;
