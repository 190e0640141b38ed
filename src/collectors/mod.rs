pub mod net;
pub mod perf;
pub mod psi;
