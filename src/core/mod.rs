//! Core engine services: progress fan-out, file storage and parsing, text
//! splitting, embedding and chat providers, the vector + graph store,
//! entity extraction, retrieval, chat orchestration, and the service
//! registry that wires them together.

pub mod chat;
pub mod embedding;
pub mod extract;
pub mod files;
pub mod llm;
pub mod logging;
pub mod metadata;
pub mod model_admin;
pub mod progress;
pub mod retrieval;
pub mod services;
pub mod split;
pub mod storage;
