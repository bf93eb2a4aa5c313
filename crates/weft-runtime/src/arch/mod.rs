//! Architecture-specific context switching
//!
//! Each submodule provides `Registers`, `init_context` and `context_switch`
//! for one target. Only x86_64 is implemented today.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{context_switch, init_context, Registers};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{context_switch, init_context, Registers};
    } else {
        compile_error!("weft-runtime: unsupported target architecture");
    }
}
