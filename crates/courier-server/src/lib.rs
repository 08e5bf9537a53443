//! The courier hub: accepts peer connections, routes chat and file-transfer
//! frames between them, and keeps the book on in-flight transfers.

pub mod hub;
pub mod registry;
mod seqset;
