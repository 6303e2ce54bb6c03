//! Kernel-enforced syscall sandbox for the unprivileged worker.
//!
//! After the worker has dropped privileges, [`install`] confines it to a
//! fixed allow-list of syscalls compiled into a classic-BPF seccomp
//! filter.  Any syscall outside the list kills the process.  There is no
//! way to inspect, weaken or remove the filter once installed.

use crate::error::Error;
use log::{debug, info};
use nix::errno::Errno;
use std::sync::atomic::{AtomicBool, Ordering};

mod arch;

// Classic-BPF opcodes, seccomp actions and the `seccomp_data` field offsets
// are kernel ABI that `libc` does not export.
const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;

const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;

/// Byte offsets into `struct seccomp_data`.
const SECCOMP_DATA_NR: u32 = 0;
const SECCOMP_DATA_ARCH: u32 = 4;
const SECCOMP_DATA_ARGS: u32 = 16;

const fn arg_offset(index: u32) -> u32 {
    SECCOMP_DATA_ARGS + index * 8
}

/// One allow-list entry: a syscall, optionally constrained to a single
/// required value in one argument register.
#[derive(Debug, Clone, Copy)]
struct Rule {
    nr: libc::c_long,
    arg: Option<(u32, u64)>,
}

impl Rule {
    const fn syscall(nr: libc::c_long) -> Self {
        Self { nr, arg: None }
    }

    const fn syscall_arg(nr: libc::c_long, index: u32, value: u64) -> Self {
        Self {
            nr,
            arg: Some((index, value)),
        }
    }
}

/// The syscalls the worker legitimately needs: socket I/O, the event loop,
/// memory mapping, descriptor management, timing, a read-only subset of
/// interface ioctls and graceful shutdown.
///
/// `socket(2)` is deliberately absent.  Opening kernel routing sockets is
/// the relay's capability, and the relay never installs this filter.
static ALLOWED: &[Rule] = &[
    Rule::syscall(libc::SYS_accept),
    Rule::syscall(libc::SYS_brk),
    Rule::syscall(libc::SYS_clock_gettime),
    Rule::syscall(libc::SYS_close),
    Rule::syscall(libc::SYS_epoll_create1),
    Rule::syscall(libc::SYS_epoll_ctl),
    // `epoll_wait` only exists on architectures old enough to predate
    // `epoll_pwait`.
    #[cfg(target_arch = "x86_64")]
    Rule::syscall(libc::SYS_epoll_wait),
    Rule::syscall(libc::SYS_epoll_pwait),
    Rule::syscall(libc::SYS_eventfd2),
    Rule::syscall(libc::SYS_exit_group),
    Rule::syscall(libc::SYS_fcntl),
    Rule::syscall(libc::SYS_fstat),
    Rule::syscall(libc::SYS_futex),
    Rule::syscall(libc::SYS_getpid),
    Rule::syscall(libc::SYS_gettimeofday),
    Rule::syscall_arg(libc::SYS_ioctl, 1, libc::SIOCGIFFLAGS as u64),
    Rule::syscall_arg(libc::SYS_ioctl, 1, libc::SIOCGIFHWADDR as u64),
    Rule::syscall_arg(libc::SYS_ioctl, 1, libc::SIOCGIFINDEX as u64),
    Rule::syscall_arg(libc::SYS_ioctl, 1, libc::SIOCGIFMTU as u64),
    Rule::syscall_arg(libc::SYS_ioctl, 1, arch::SIOCGIFVLAN as u64),
    Rule::syscall(libc::SYS_mmap),
    Rule::syscall(libc::SYS_munmap),
    Rule::syscall(libc::SYS_ppoll),
    Rule::syscall(libc::SYS_read),
    Rule::syscall(libc::SYS_readv),
    Rule::syscall(libc::SYS_recvfrom),
    Rule::syscall(libc::SYS_recvmsg),
    Rule::syscall(libc::SYS_rt_sigreturn),
    Rule::syscall(libc::SYS_sendmsg),
    Rule::syscall(libc::SYS_sendto),
    Rule::syscall(libc::SYS_shutdown),
    Rule::syscall(libc::SYS_uname),
    Rule::syscall(libc::SYS_wait4),
    Rule::syscall(libc::SYS_write),
    Rule::syscall(libc::SYS_writev),
];

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the syscall filter for the calling process.
///
/// This must run after privileges have been dropped and after every
/// descriptor the worker legitimately holds has been acquired, but before
/// any untrusted input is read.  Installation is a one-way door: the filter
/// cannot be removed or relaxed for the remaining process lifetime.
///
/// [`Error::SandboxUnsupported`] means the running kernel lacks seccomp
/// filtering; any other error is an unexpected installation failure.  Both
/// are fatal for the caller: the worker must not continue unsandboxed.
pub fn install() -> Result<(), Error> {
    install_guarded(&INSTALLED, enter)
}

fn install_guarded(
    installed: &AtomicBool,
    enter: impl FnOnce(&[libc::sock_filter]) -> Result<(), Error>,
) -> Result<(), Error> {
    if installed.load(Ordering::SeqCst) {
        debug!("syscall filter already installed");
        return Ok(());
    }

    // The flag must only latch once the filter is in place: a failed
    // attempt leaves it clear so a retry does not return `Ok` unsandboxed.
    // Two racing callers may both install; stacked identical filters are
    // harmless.
    let filter = program(ALLOWED);
    enter(&filter)?;
    installed.store(true, Ordering::SeqCst);

    info!("installed syscall filter, {} instructions", filter.len());
    Ok(())
}

/// Compile the allow-list into a BPF filter program.
///
/// The program always starts with the architecture-identity check and
/// always ends with the terminal deny; table entries are emitted in order
/// in between.
fn program(rules: &[Rule]) -> Vec<libc::sock_filter> {
    let mut prog = Vec::with_capacity(4 + rules.len() * 7 + 1);

    // A syscall arriving under a foreign architecture's numbering is killed
    // before the allow-list is consulted.
    prog.push(stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_ARCH));
    prog.push(jump(BPF_JMP | BPF_JEQ | BPF_K, arch::AUDIT_ARCH, 1, 0));
    prog.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS));

    prog.push(stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_NR));

    for rule in rules {
        let nr = rule.nr as u32;
        match rule.arg {
            None => {
                prog.push(jump(BPF_JMP | BPF_JEQ | BPF_K, nr, 0, 1));
                prog.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
            }
            Some((index, value)) => {
                // On an argument mismatch, fall through to the next rule
                // rather than to the terminal deny, so several constrained
                // rules may share one syscall number.
                prog.push(jump(BPF_JMP | BPF_JEQ | BPF_K, nr, 0, 6));
                prog.push(stmt(BPF_LD | BPF_W | BPF_ABS, arg_offset(index) + arch::ARG_LO));
                prog.push(jump(BPF_JMP | BPF_JEQ | BPF_K, value as u32, 0, 3));
                prog.push(stmt(BPF_LD | BPF_W | BPF_ABS, arg_offset(index) + arch::ARG_HI));
                prog.push(jump(BPF_JMP | BPF_JEQ | BPF_K, (value >> 32) as u32, 0, 1));
                prog.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
                // The accumulator held an argument word; reload the syscall
                // number for the next rule.
                prog.push(stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_NR));
            }
        }
    }

    prog.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS));
    prog
}

/// Activate the filter: forbid gaining new privileges, then install.
fn enter(filter: &[libc::sock_filter]) -> Result<(), Error> {
    if filter.len() > u16::MAX as usize {
        return Err(Error::Sandbox(nix::Error::Sys(Errno::EINVAL)));
    }

    let prog = libc::sock_fprog {
        len: filter.len() as u16,
        filter: filter.as_ptr() as *mut libc::sock_filter,
    };

    let ret = unsafe {
        if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1u64, 0u64, 0u64, 0u64) == -1 {
            -1
        } else {
            libc::prctl(
                libc::PR_SET_SECCOMP,
                libc::SECCOMP_MODE_FILTER as libc::c_ulong,
                &prog as *const libc::sock_fprog,
            )
        }
    };

    if ret == -1 {
        Err(install_error(Errno::last()))
    } else {
        Ok(())
    }
}

/// Kernels without seccomp filtering report `EINVAL`; normalize it so
/// callers can give an actionable diagnostic.
fn install_error(errno: Errno) -> Error {
    match errno {
        Errno::EINVAL | Errno::ENOSYS => Error::SandboxUnsupported,
        errno => Error::Sandbox(nix::Error::Sys(errno)),
    }
}

fn stmt(code: u16, k: u32) -> libc::sock_filter {
    libc::sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

fn jump(code: u16, k: u32, jt: u8, jf: u8) -> libc::sock_filter {
    libc::sock_filter { code, jt, jf, k }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Lay out a `struct seccomp_data` as the kernel hands it to BPF.
    fn seccomp_data(nr: libc::c_long, arch_tag: u32, args: [u64; 6]) -> Vec<u8> {
        let mut data = Vec::with_capacity(64);
        data.extend_from_slice(&(nr as i32).to_ne_bytes());
        data.extend_from_slice(&arch_tag.to_ne_bytes());
        data.extend_from_slice(&0u64.to_ne_bytes());
        for arg in &args {
            data.extend_from_slice(&arg.to_ne_bytes());
        }
        data
    }

    /// Evaluate the LD/JEQ/RET subset the filter builder emits.
    fn run(prog: &[libc::sock_filter], data: &[u8]) -> u32 {
        let mut a = 0u32;
        let mut pc = 0usize;

        loop {
            let insn = &prog[pc];
            pc += 1;

            match insn.code {
                c if c == BPF_LD | BPF_W | BPF_ABS => {
                    let offset = insn.k as usize;
                    let mut word = [0u8; 4];
                    word.copy_from_slice(&data[offset..offset + 4]);
                    a = u32::from_ne_bytes(word);
                }
                c if c == BPF_JMP | BPF_JEQ | BPF_K => {
                    pc += if a == insn.k {
                        insn.jt as usize
                    } else {
                        insn.jf as usize
                    };
                }
                c if c == BPF_RET | BPF_K => return insn.k,
                code => panic!("unexpected BPF opcode {:#x}", code),
            }
        }
    }

    fn native(nr: libc::c_long) -> Vec<u8> {
        seccomp_data(nr, arch::AUDIT_ARCH, [0; 6])
    }

    fn ioctl(request: u64) -> Vec<u8> {
        seccomp_data(libc::SYS_ioctl, arch::AUDIT_ARCH, [0, request, 0, 0, 0, 0])
    }

    #[test]
    fn test_deterministic_build() {
        let a = program(ALLOWED);
        let b = program(ALLOWED);

        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!((x.code, x.jt, x.jf, x.k), (y.code, y.jt, y.jf, y.k));
        }
    }

    #[test]
    fn test_arch_check_first_deny_last() {
        let prog = program(ALLOWED);

        assert_eq!(prog[0].code, BPF_LD | BPF_W | BPF_ABS);
        assert_eq!(prog[0].k, SECCOMP_DATA_ARCH);
        assert_eq!(prog[1].code, BPF_JMP | BPF_JEQ | BPF_K);
        assert_eq!(prog[1].k, arch::AUDIT_ARCH);
        assert_eq!(prog[2].k, SECCOMP_RET_KILL_PROCESS);

        let last = prog.last().unwrap();
        assert_eq!(last.code, BPF_RET | BPF_K);
        assert_eq!(last.k, SECCOMP_RET_KILL_PROCESS);
    }

    #[test]
    fn test_allowed_syscall() {
        let prog = program(ALLOWED);

        assert_eq!(run(&prog, &native(libc::SYS_read)), SECCOMP_RET_ALLOW);
        assert_eq!(run(&prog, &native(libc::SYS_sendmsg)), SECCOMP_RET_ALLOW);
        assert_eq!(run(&prog, &native(libc::SYS_exit_group)), SECCOMP_RET_ALLOW);
    }

    #[test]
    fn test_unlisted_syscall_killed() {
        let prog = program(ALLOWED);

        // The routing-socket capability must not exist in the worker.
        assert_eq!(
            run(&prog, &native(libc::SYS_socket)),
            SECCOMP_RET_KILL_PROCESS
        );
        assert_eq!(
            run(&prog, &native(libc::SYS_openat)),
            SECCOMP_RET_KILL_PROCESS
        );
    }

    #[test]
    fn test_foreign_arch_killed() {
        let prog = program(ALLOWED);
        let data = seccomp_data(libc::SYS_read, arch::AUDIT_ARCH ^ 1, [0; 6]);

        assert_eq!(run(&prog, &data), SECCOMP_RET_KILL_PROCESS);
    }

    #[test]
    fn test_ioctl_request_codes() {
        let prog = program(ALLOWED);

        assert_eq!(
            run(&prog, &ioctl(libc::SIOCGIFFLAGS as u64)),
            SECCOMP_RET_ALLOW
        );
        // A later constrained rule for the same syscall number still
        // matches: mismatches fall through instead of denying.
        assert_eq!(
            run(&prog, &ioctl(libc::SIOCGIFMTU as u64)),
            SECCOMP_RET_ALLOW
        );
        assert_eq!(
            run(&prog, &ioctl(arch::SIOCGIFVLAN as u64)),
            SECCOMP_RET_ALLOW
        );
        // TCGETS is not an interface ioctl and must be refused.
        assert_eq!(run(&prog, &ioctl(0x5401)), SECCOMP_RET_KILL_PROCESS);
    }

    #[test]
    fn test_no_duplicate_rules() {
        for (i, a) in ALLOWED.iter().enumerate() {
            for b in &ALLOWED[i + 1..] {
                assert!(
                    a.nr != b.nr || a.arg != b.arg,
                    "duplicate rule for syscall {}",
                    a.nr
                );
            }
        }
    }

    #[test]
    fn test_failed_install_leaves_guard_clear() {
        let installed = AtomicBool::new(false);

        let err = install_guarded(&installed, |_| Err(Error::SandboxUnsupported)).unwrap_err();
        assert!(matches!(err, Error::SandboxUnsupported));
        assert!(!installed.load(Ordering::SeqCst));

        // A retry after the failure must attempt installation again.
        install_guarded(&installed, |_| Ok(())).expect("retry installs");
        assert!(installed.load(Ordering::SeqCst));

        // Only a successful installation makes later calls a no-op.
        install_guarded(&installed, |_| panic!("filter reinstalled")).expect("no-op");
    }

    #[test]
    fn test_install_error_normalization() {
        assert!(matches!(
            install_error(Errno::EINVAL),
            Error::SandboxUnsupported
        ));
        assert!(matches!(
            install_error(Errno::ENOSYS),
            Error::SandboxUnsupported
        ));
        assert!(matches!(
            install_error(Errno::EACCES),
            Error::Sandbox(Errno::EACCES)
        ));
    }

    #[test]
    fn test_program_fits_one_filter() {
        assert!(program(ALLOWED).len() <= u16::MAX as usize);
    }
}
