//! # L4 Platform Abstraction Layer
//!
//! The microkernel interface consumed by the capability core:
//! - **Types**: capability indices, flexpages, message tags, flag words
//! - **Adapter**: the [`Microkernel`] trait, one method per kernel service
//! - **Mock** (default feature): an in-memory kernel for unit testing
//!
//! ## Usage
//!
//! ```rust
//! use l4_platform::{CapIdx, Microkernel};
//!
//! fn is_alive<K: Microkernel>(kernel: &K) -> bool {
//!     kernel.main_thread().is_valid()
//! }
//! ```
//!
//! ## Build Modes
//!
//! ```bash
//! # Mock (default - testing)
//! cargo build
//!
//! # Interface only
//! cargo build --no-default-features
//! ```

#![no_std]

#[cfg(test)]
extern crate std;

#[cfg(feature = "mock")]
extern crate alloc;

/// Kernel ABI types
pub mod types;

/// The kernel interface trait and return-code helpers
pub mod adapter;

/// In-memory kernel for tests
#[cfg(feature = "mock")]
pub mod mock;

pub use adapter::{check, Microkernel};
pub use types::*;

/// Platform configuration and detection
pub mod config {
    /// Which backend is compiled in
    pub fn platform_mode() -> &'static str {
        if is_mock() {
            "mock"
        } else {
            "interface"
        }
    }

    /// Check if the mock kernel is available
    pub const fn is_mock() -> bool {
        cfg!(feature = "mock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_detection() {
        let mode = config::platform_mode();
        assert!(mode == "mock" || mode == "interface");
    }

    #[test]
    #[cfg(feature = "mock")]
    fn test_mock_mode() {
        assert!(config::is_mock());
    }

    #[test]
    fn test_check_codes() {
        assert!(adapter::is_ok(0));
        assert!(adapter::is_err(-22));
        assert_eq!(check(-12), Err(KernelError::NoMemory));
    }
}
