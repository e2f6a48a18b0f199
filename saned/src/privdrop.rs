//! Daemonization and privilege dropping for standalone mode.

use std::ffi::CString;
use std::io;

/// Detach from the controlling terminal: fork (parent exits), start a
/// new session, move to `/` and point stdio at `/dev/null`.
pub fn daemonize() -> io::Result<()> {
    // SAFETY: called before the async runtime exists, so no runtime
    // threads are lost in the child.
    match unsafe { libc::fork() } {
        -1 => return Err(io::Error::last_os_error()),
        0 => {}
        _ => std::process::exit(0),
    }
    if unsafe { libc::setsid() } == -1 {
        return Err(io::Error::last_os_error());
    }
    let root = CString::new("/").expect("static string");
    // SAFETY: plain syscalls on owned C strings and raw fds.
    unsafe {
        libc::chdir(root.as_ptr());
        let devnull = CString::new("/dev/null").expect("static string");
        let fd = libc::open(devnull.as_ptr(), libc::O_RDWR);
        if fd >= 0 {
            libc::dup2(fd, 0);
            libc::dup2(fd, 1);
            libc::dup2(fd, 2);
            if fd > 2 {
                libc::close(fd);
            }
        }
    }
    Ok(())
}

/// Become `user`: look it up, adopt its supplementary groups, then drop
/// group and user ids in that order.
pub fn drop_to_user(user: &str) -> io::Result<()> {
    let name = CString::new(user)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "user name contains NUL"))?;
    // SAFETY: getpwnam returns a pointer into static storage; it is read
    // before any other passwd call.
    let pw = unsafe { libc::getpwnam(name.as_ptr()) };
    if pw.is_null() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no such user: {user}"),
        ));
    }
    let (uid, gid) = unsafe { ((*pw).pw_uid, (*pw).pw_gid) };
    // SAFETY: plain syscalls; order matters, gid before uid.
    unsafe {
        if libc::initgroups(name.as_ptr(), gid) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::setgid(gid) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::setuid(uid) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
