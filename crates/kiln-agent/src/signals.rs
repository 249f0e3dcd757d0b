//! Process-group signalling for supervised children.
//!
//! Every child runs in its own session, so signalling `-pgid` also reaches
//! anything the server forked (wrapper scripts, JVM helpers).

use tokio::process::Command;

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the agent dies, take the child down with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

/// Put the child in a fresh session so it owns a process group.
pub(crate) fn isolate_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            set_parent_death_signal()?;
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    Term,
    Kill,
}

impl Signal {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Term => "SIGTERM",
            Self::Kill => "SIGKILL",
        }
    }
}

/// Signal a whole process group. Returns false if nothing was signalled.
pub(crate) fn signal_group(pgid: i32, signal: Signal) -> bool {
    #[cfg(unix)]
    {
        let sig = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        let rc = unsafe { libc::kill(-pgid, sig) };
        if rc == -1 {
            tracing::debug!(
                pgid,
                signal = signal.name(),
                error = %std::io::Error::last_os_error(),
                "signal not delivered"
            );
            return false;
        }
        true
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, signal);
        false
    }
}
