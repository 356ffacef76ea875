use crate::file::File;
use crate::println;
use crate::proc::{Proc, ProcData, CPUS};
use crate::sysctbl::SysCallNum;
use crate::vm::{Addr, UVAddr};
use alloc::sync::Arc;
use core::mem::size_of;

// Raw file descriptors.
pub type RawFd = usize;

// One system call invocation: the calling process plus its
// private data, fetched once at dispatch.
pub struct SysCalls<'a> {
    pub proc: &'a Arc<Proc>,
    pub data: &'a mut ProcData,
}

pub fn syscall() {
    let p = CPUS.my_proc().unwrap();
    let num = p.trapframe().a7;

    let ret = match SysCallNum::from_usize(num) {
        Some(call) => SysCalls {
            proc: p,
            data: p.data_mut(),
        }
        .dispatch(call),
        None => {
            println!("{} {}: unknown sys call {}", p.pid(), p.data().name, num);
            Err(())
        }
    };

    // Return value goes in a0; errors become -1.
    p.trapframe_mut().a0 = ret.unwrap_or(-1isize as usize);
}

impl SysCalls<'_> {
    fn dispatch(mut self, call: SysCallNum) -> Result<usize, ()> {
        match call {
            SysCallNum::SysFork => self.sys_fork(),
            SysCallNum::SysExit => self.sys_exit(),
            SysCallNum::SysWait => self.sys_wait(),
            SysCallNum::SysPipe => self.sys_pipe(),
            SysCallNum::SysRead => self.sys_read(),
            SysCallNum::SysKill => self.sys_kill(),
            SysCallNum::SysExec => self.sys_exec(),
            SysCallNum::SysFstat => self.sys_fstat(),
            SysCallNum::SysChdir => self.sys_chdir(),
            SysCallNum::SysDup => self.sys_dup(),
            SysCallNum::SysGetpid => self.sys_getpid(),
            SysCallNum::SysSbrk => self.sys_sbrk(),
            SysCallNum::SysSleep => self.sys_sleep(),
            SysCallNum::SysUptime => self.sys_uptime(),
            SysCallNum::SysOpen => self.sys_open(),
            SysCallNum::SysWrite => self.sys_write(),
            SysCallNum::SysMknod => self.sys_mknod(),
            SysCallNum::SysUnlink => self.sys_unlink(),
            SysCallNum::SysLink => self.sys_link(),
            SysCallNum::SysMkdir => self.sys_mkdir(),
            SysCallNum::SysClose => self.sys_close(),
        }
    }

    // Fetch the nth 64-bit system call argument.
    pub fn arg(&self, n: usize) -> usize {
        let tf = self.proc.trapframe();
        match n {
            0 => tf.a0,
            1 => tf.a1,
            2 => tf.a2,
            3 => tf.a3,
            4 => tf.a4,
            5 => tf.a5,
            _ => panic!("arg"),
        }
    }

    // Retrieve an argument as a user virtual address.
    // Doesn't check legality, since copyin/copyout will do that.
    pub fn arg_addr(&self, n: usize) -> UVAddr {
        UVAddr::from(self.arg(n))
    }

    // Fetch the usize at addr from user memory.
    pub fn fetch_addr(&mut self, addr: UVAddr) -> Result<usize, ()> {
        let end = addr.into_usize().checked_add(size_of::<usize>()).ok_or(())?;
        if end > self.data.sz {
            return Err(());
        }
        let mut val: usize = 0;
        unsafe { self.data.uvm.as_mut().unwrap().copyin(&mut val, addr)? };
        Ok(val)
    }

    // Fetch the NUL-terminated string at addr from user memory.
    pub fn fetch_str<'b>(&mut self, addr: UVAddr, buf: &'b mut [u8]) -> Result<&'b str, ()> {
        self.data
            .uvm
            .as_mut()
            .unwrap()
            .copyinstr(buf, addr)
            .map_err(|_| ())?;
        let len = buf.iter().position(|&c| c == 0).ok_or(())?;
        core::str::from_utf8(&buf[..len]).map_err(|_| ())
    }

    // Fetch the nth word-sized system call argument as a
    // NUL-terminated string into buf.
    pub fn arg_str<'b>(&mut self, n: usize, buf: &'b mut [u8]) -> Result<&'b str, ()> {
        let addr = self.arg_addr(n);
        self.fetch_str(addr, buf)
    }

    // Fetch the nth system call argument as a file descriptor
    // and return both the descriptor and the open file.
    pub fn arg_fd(&self, n: usize) -> Option<(RawFd, &File)> {
        let fd = self.arg(n);
        match self.data.ofile.get(fd)? {
            Some(f) => Some((fd, f)),
            None => None,
        }
    }

    // Allocate a file descriptor for the given file,
    // taking it over from the caller.
    pub fn fdalloc(&mut self, file: File) -> Option<RawFd> {
        for (fd, f) in self.data.ofile.iter_mut().enumerate() {
            if f.is_none() {
                f.replace(file);
                return Some(fd);
            }
        }
        None
    }
}
