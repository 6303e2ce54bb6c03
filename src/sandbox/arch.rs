//! Per-architecture constants for the syscall filter.
//!
//! The filter builder only ever refers to these symbolic names; porting to
//! another architecture means supplying the constants here.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
        /// Audit architecture tag checked before the allow-list.
        pub const AUDIT_ARCH: u32 = 0xc000_003e;
    } else if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
        pub const AUDIT_ARCH: u32 = 0xc000_00b7;
    } else if #[cfg(all(target_os = "linux", target_arch = "riscv64"))] {
        pub const AUDIT_ARCH: u32 = 0xc000_00f3;
    } else {
        // Refusing to build beats a filter that silently does not apply.
        compile_error!("the syscall filter is not ported to this platform");
    }
}

// A 64-bit syscall argument is compared as two 32-bit words whose order
// depends on the target byte order.
cfg_if! {
    if #[cfg(target_endian = "little")] {
        pub const ARG_LO: u32 = 0;
        pub const ARG_HI: u32 = 4;
    } else {
        pub const ARG_LO: u32 = 4;
        pub const ARG_HI: u32 = 0;
    }
}

/// `SIOCGIFVLAN` is absent from `libc`.
pub const SIOCGIFVLAN: libc::c_ulong = 0x8982;
