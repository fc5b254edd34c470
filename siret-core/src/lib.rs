pub mod message;
pub mod storage;
