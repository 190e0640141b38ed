pub mod collectors;
pub mod config;
pub mod types;

pub use config::Config;
pub use types::{LlcSample, MemBwSample, NetSample, PsiEvent, PsiKind, PsiResource};
