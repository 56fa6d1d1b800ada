//! Seccomp filter that keeps the sandboxed interpreter from creating processes.
//!
//! **Rules:**
//! 1. Syscalls from a foreign ABI (i386, x32) are refused
//! 2. `fork` and `vfork` fail with EPERM
//! 3. `clone3` fails with ENOSYS so libc falls back to `clone`, whose flags
//!    the filter can read
//! 4. `clone` passes only with `CLONE_THREAD` (threads yes, processes no)
//! 5. Everything else is allowed
//!
//! Installed between fork and exec, after no-new-privs. The filter is built in
//! the parent because allocation is not allowed in the child.

const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;

const BPF_LD_W_ABS: u16 = 0x20;
const BPF_JEQ_K: u16 = 0x15;
const BPF_JGE_K: u16 = 0x35;
const BPF_JSET_K: u16 = 0x45;
const BPF_RET_K: u16 = 0x06;

/// `struct seccomp_data` offsets
const OFFSET_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;
/// Low word of the first argument (clone flags) on little-endian targets
const OFFSET_ARG0_LOW: u32 = 16;

const CLONE_THREAD: u32 = 0x0001_0000;
const X32_SYSCALL_BIT: u32 = 0x4000_0000;
const EPERM: u32 = 1;
const ENOSYS: u32 = 38;

#[cfg(target_arch = "x86_64")]
mod arch {
    pub const AUDIT_ARCH: u32 = 0xc000_003e;
    pub const CLONE: u32 = 56;
    pub const CLONE3: u32 = 435;
    /// fork, vfork
    pub const DENIED: &[u32] = &[57, 58];
}

#[cfg(target_arch = "aarch64")]
mod arch {
    pub const AUDIT_ARCH: u32 = 0xc000_00b7;
    pub const CLONE: u32 = 220;
    pub const CLONE3: u32 = 435;
    pub const DENIED: &[u32] = &[];
}

/// One classic BPF instruction, laid out like the kernel's `sock_filter`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

fn stmt(code: u16, k: u32) -> Instruction {
    Instruction { code, jt: 0, jf: 0, k }
}

fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Instruction {
    Instruction { code, jt, jf, k }
}

/// Relative jump offset from the instruction at `from` to `to`.
fn offset(from: usize, to: usize) -> u8 {
    (to - from - 1) as u8
}

/// Filter program for an architecture. Layout:
/// arch check, syscall dispatch, clone flag check, then ALLOW / DENY / ENOSYS.
fn build(audit_arch: u32, clone: u32, clone3: u32, denied: &[u32]) -> Vec<Instruction> {
    let check_clone = 6 + denied.len();
    let allow = check_clone + 3;
    let deny = allow + 1;
    let no_sys = deny + 1;

    let mut program = vec![
        stmt(BPF_LD_W_ABS, OFFSET_ARCH),
        jump(BPF_JEQ_K, audit_arch, 1, 0),
        stmt(BPF_RET_K, SECCOMP_RET_ERRNO | EPERM),
        stmt(BPF_LD_W_ABS, OFFSET_NR),
    ];
    program.push(jump(BPF_JGE_K, X32_SYSCALL_BIT, offset(4, deny), 0));
    program.push(jump(BPF_JEQ_K, clone3, offset(5, no_sys), 0));
    for (i, nr) in denied.iter().enumerate() {
        let pc = 6 + i;
        program.push(jump(BPF_JEQ_K, *nr, offset(pc, deny), 0));
    }
    program.push(jump(BPF_JEQ_K, clone, 0, offset(check_clone, allow)));
    program.push(stmt(BPF_LD_W_ABS, OFFSET_ARG0_LOW));
    program.push(jump(BPF_JSET_K, CLONE_THREAD, 0, 1));
    program.push(stmt(BPF_RET_K, SECCOMP_RET_ALLOW));
    program.push(stmt(BPF_RET_K, SECCOMP_RET_ERRNO | EPERM));
    program.push(stmt(BPF_RET_K, SECCOMP_RET_ERRNO | ENOSYS));
    program
}

/// Prebuilt filter, ready to install in a forked child.
#[derive(Debug, Clone)]
pub struct ProcessFilter {
    program: Vec<Instruction>,
}

impl ProcessFilter {
    /// `None` on targets without a filter (the caller falls back to
    /// `RLIMIT_NPROC`).
    #[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
    pub fn new() -> Option<Self> {
        Some(Self {
            program: build(arch::AUDIT_ARCH, arch::CLONE, arch::CLONE3, arch::DENIED),
        })
    }

    #[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
    pub fn new() -> Option<Self> {
        None
    }

    /// Install the filter on the calling thread. Only async-signal-safe calls.
    ///
    /// # Safety
    /// Must run in the child after fork; no-new-privs has to be set first.
    #[cfg(target_os = "linux")]
    pub unsafe fn install(&self) -> std::io::Result<()> {
        const PR_SET_SECCOMP: libc::c_int = 22;
        const SECCOMP_MODE_FILTER: libc::c_ulong = 2;

        let prog = libc::sock_fprog {
            len: self.program.len() as libc::c_ushort,
            filter: self.program.as_ptr() as *mut libc::sock_filter,
        };
        if libc::prctl(
            PR_SET_SECCOMP,
            SECCOMP_MODE_FILTER,
            &prog as *const libc::sock_fprog as libc::c_ulong,
        ) != 0
        {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub unsafe fn install(&self) -> std::io::Result<()> {
        Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Walks the program the way the kernel would for one syscall.
    fn evaluate(program: &[Instruction], arch: u32, nr: u32, arg0: u32) -> u32 {
        let mut acc = 0u32;
        let mut pc = 0usize;
        loop {
            let insn = program[pc];
            match insn.code {
                BPF_LD_W_ABS => {
                    acc = match insn.k {
                        OFFSET_ARCH => arch,
                        OFFSET_NR => nr,
                        OFFSET_ARG0_LOW => arg0,
                        other => panic!("unexpected load offset {}", other),
                    };
                    pc += 1;
                }
                BPF_RET_K => return insn.k,
                code => {
                    let taken = match code {
                        BPF_JEQ_K => acc == insn.k,
                        BPF_JGE_K => acc >= insn.k,
                        BPF_JSET_K => acc & insn.k != 0,
                        other => panic!("unexpected opcode {:#x}", other),
                    };
                    let skip = if taken { insn.jt } else { insn.jf };
                    pc += 1 + skip as usize;
                }
            }
        }
    }

    const ARCH: u32 = 0xc000_003e;
    const CLONE: u32 = 56;
    const CLONE3: u32 = 435;
    const FORK: u32 = 57;
    const VFORK: u32 = 58;

    fn x86_program() -> Vec<Instruction> {
        build(ARCH, CLONE, CLONE3, &[FORK, VFORK])
    }

    #[test]
    fn test_threads_pass_processes_do_not() {
        let program = x86_program();
        let thread_flags = 0x003d_0f00; // what glibc passes for pthread_create
        assert_eq!(evaluate(&program, ARCH, CLONE, thread_flags), SECCOMP_RET_ALLOW);
        assert_eq!(evaluate(&program, ARCH, CLONE, 17), SECCOMP_RET_ERRNO | EPERM); // SIGCHLD fork
        assert_eq!(evaluate(&program, ARCH, FORK, 0), SECCOMP_RET_ERRNO | EPERM);
        assert_eq!(evaluate(&program, ARCH, VFORK, 0), SECCOMP_RET_ERRNO | EPERM);
        assert_eq!(evaluate(&program, ARCH, CLONE3, 0), SECCOMP_RET_ERRNO | ENOSYS);
    }

    #[test]
    fn test_other_syscalls_and_abis() {
        let program = x86_program();
        assert_eq!(evaluate(&program, ARCH, 0, 0), SECCOMP_RET_ALLOW); // read
        assert_eq!(evaluate(&program, ARCH, 59, 0), SECCOMP_RET_ALLOW); // execve
        assert_eq!(evaluate(&program, 0x4000_0003, 2, 0), SECCOMP_RET_ERRNO | EPERM); // i386
        assert_eq!(
            evaluate(&program, ARCH, X32_SYSCALL_BIT | FORK, 0),
            SECCOMP_RET_ERRNO | EPERM
        );
    }

    #[test]
    fn test_program_without_fork_syscalls() {
        let program = build(0xc000_00b7, 220, 435, &[]);
        assert_eq!(evaluate(&program, 0xc000_00b7, 220, CLONE_THREAD), SECCOMP_RET_ALLOW);
        assert_eq!(evaluate(&program, 0xc000_00b7, 220, 17), SECCOMP_RET_ERRNO | EPERM);
        assert_eq!(evaluate(&program, 0xc000_00b7, 435, 0), SECCOMP_RET_ERRNO | ENOSYS);
        assert_eq!(evaluate(&program, 0xc000_00b7, 63, 0), SECCOMP_RET_ALLOW);
    }
}
