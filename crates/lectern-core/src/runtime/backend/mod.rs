pub mod admission;
pub mod protocol;

pub use admission::{Admission, Permit, PoolConfig};
pub use protocol::{
    BackendAdapter, BackendFailure, BackendOutput, BackendRequest, BackendResult, FailureKind,
};
