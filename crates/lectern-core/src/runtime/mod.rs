pub mod backend;
pub mod dispatcher;
pub mod extract;
pub mod job;
pub mod storage;
pub mod types;
