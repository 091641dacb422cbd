pub mod connectivity;
pub mod decision;
pub mod error;
pub mod forward;
pub mod provider;
pub mod retry;
pub mod subscription;
pub mod supervisor;
