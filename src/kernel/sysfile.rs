// File-system system calls.
// Mostly argument checking, since we don't trust
// user code, and calls into fs.rs and file.rs.

use crate::exec::exec;
use crate::fcntl::OMode;
use crate::file::{FType, FTABLE};
use crate::fs::{self, Path};
use crate::log::LOG;
use crate::param::{MAXARG, MAXPATH};
use crate::pipe::Pipe;
use crate::riscv::PGSIZE;
use crate::stat::IType;
use crate::syscall::SysCalls;
use crate::vm::UVAddr;
use alloc::string::String;
use alloc::vec;
use array_macro::array;
use core::mem::size_of;

impl SysCalls<'_> {
    pub fn sys_dup(&mut self) -> Result<usize, ()> {
        let (_, f) = self.arg_fd(0).ok_or(())?;
        let f = f.clone();
        self.fdalloc(f).ok_or(())
    }

    pub fn sys_read(&mut self) -> Result<usize, ()> {
        let addr = self.arg_addr(1);
        let n = self.arg(2);
        let (_, f) = self.arg_fd(0).ok_or(())?;
        f.read(From::from(addr), n)
    }

    pub fn sys_write(&mut self) -> Result<usize, ()> {
        let addr = self.arg_addr(1);
        let n = self.arg(2);
        let (_, f) = self.arg_fd(0).ok_or(())?;
        f.write(From::from(addr), n)
    }

    pub fn sys_close(&mut self) -> Result<usize, ()> {
        let fd = self.arg_fd(0).ok_or(())?.0;
        drop(self.data.ofile[fd].take());
        Ok(0)
    }

    pub fn sys_fstat(&mut self) -> Result<usize, ()> {
        let addr = self.arg_addr(1); // user pointer to struct Stat
        let (_, f) = self.arg_fd(0).ok_or(())?;
        f.stat(From::from(addr)).and(Ok(0))
    }

    // Create the path new as a link to the same inode as old.
    pub fn sys_link(&mut self) -> Result<usize, ()> {
        let mut old = [0u8; MAXPATH];
        let mut new = [0u8; MAXPATH];
        let old = Path::new(self.arg_str(0, &mut old)?);
        let new = Path::new(self.arg_str(1, &mut new)?);

        LOG.begin_op();
        let res = fs::link(old, new);
        LOG.end_op();

        res.and(Ok(0))
    }

    pub fn sys_unlink(&mut self) -> Result<usize, ()> {
        let mut path = [0u8; MAXPATH];
        let path = Path::new(self.arg_str(0, &mut path)?);

        LOG.begin_op();
        let res = fs::unlink(path);
        LOG.end_op();

        res.and(Ok(0))
    }

    pub fn sys_open(&mut self) -> Result<usize, ()> {
        let mut path = [0u8; MAXPATH];
        let omode = self.arg(1);
        let path = Path::new(self.arg_str(0, &mut path)?);

        LOG.begin_op();
        let fd = FTABLE
            .alloc(OMode::from_usize(omode), FType::Node(path))
            .and_then(|f| self.fdalloc(f));
        LOG.end_op();

        fd.ok_or(())
    }

    pub fn sys_mkdir(&mut self) -> Result<usize, ()> {
        let mut path = [0u8; MAXPATH];
        let path = Path::new(self.arg_str(0, &mut path)?);

        LOG.begin_op();
        let res = fs::create(path, IType::Dir, 0, 0).ok_or(());
        LOG.end_op();

        res.and(Ok(0))
    }

    pub fn sys_mknod(&mut self) -> Result<usize, ()> {
        let mut path = [0u8; MAXPATH];
        let path = Path::new(self.arg_str(0, &mut path)?);
        let major = self.arg(1) as u16;
        let minor = self.arg(2) as u16;

        LOG.begin_op();
        let res = fs::create(path, IType::Device, major, minor).ok_or(());
        LOG.end_op();

        res.and(Ok(0))
    }

    pub fn sys_chdir(&mut self) -> Result<usize, ()> {
        let mut path = [0u8; MAXPATH];

        LOG.begin_op();
        let res = (|| {
            let path = Path::new(self.arg_str(0, &mut path)?);
            let (_, ip) = path.namei().ok_or(())?;
            if ip.lock().itype() != IType::Dir {
                return Err(());
            }
            // the old cwd reference is released inside this
            // transaction.
            drop(self.data.cwd.replace(ip));
            Ok(0)
        })();
        LOG.end_op();

        res
    }

    pub fn sys_exec(&mut self) -> Result<usize, ()> {
        let mut path = [0u8; MAXPATH];
        let uargv = self.arg_addr(1);

        let mut argv: [Option<String>; MAXARG] = array![_ => None; MAXARG];
        // a whole page for one argument string; too big for the
        // kernel stack.
        let mut buf = vec![0u8; PGSIZE];

        let mut i = 0;
        loop {
            if i >= MAXARG {
                return Err(());
            }
            let uarg = self.fetch_addr(uargv + i * size_of::<usize>())?;
            if uarg == 0 {
                break;
            }
            let arg = self.fetch_str(UVAddr::from(uarg), &mut buf)?;
            argv[i] = Some(String::from(arg));
            i += 1;
        }

        let path = Path::new(self.arg_str(0, &mut path)?);
        exec(path, &argv)
    }

    pub fn sys_pipe(&mut self) -> Result<usize, ()> {
        let fdarray = self.arg_addr(0); // user pointer to two descriptors

        let (rf, wf) = Pipe::alloc().ok_or(())?;
        let fd0 = self.fdalloc(rf).ok_or(())?;
        let fd1 = match self.fdalloc(wf) {
            Some(fd) => fd,
            None => {
                drop(self.data.ofile[fd0].take());
                return Err(());
            }
        };

        let uvm = self.data.uvm.as_mut().unwrap();
        if unsafe {
            uvm.copyout(fdarray, &fd0).is_err()
                || uvm.copyout(fdarray + size_of::<usize>(), &fd1).is_err()
        } {
            drop(self.data.ofile[fd0].take());
            drop(self.data.ofile[fd1].take());
            return Err(());
        }
        Ok(0)
    }
}
