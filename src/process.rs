use std::os::unix::process::ExitStatusExt as _;
use std::process::ExitStatus;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
#[allow(unused_imports)]
use log::{debug, warn};
use nix::{
    errno::Errno,
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use tokio::{process::Child, time::timeout};

pub trait ExitStatusExt {
    // Returns exit code, fails verbosely if the process was killed by a signal.
    fn code_not_killed(&self) -> anyhow::Result<i32>;
}

impl ExitStatusExt for ExitStatus {
    fn code_not_killed(&self) -> anyhow::Result<i32> {
        match (self.code(), self.signal()) {
            (Some(code), _) => Ok(code),
            (None, Some(signal)) => Err(anyhow!("terminated by signal {}", signal)),
            (None, None) => Err(anyhow!("exited with neither a code nor a signal")),
        }
    }
}

pub trait ChildExt {
    // Ask the child's process group to exit with SIGTERM, then SIGKILL whatever
    // is left of it after `grace_period`. The child must have been spawned as a
    // group leader (`process_group(0)`). Always reaps the child.
    async fn terminate(&mut self, grace_period: Duration) -> anyhow::Result<()>;
}

impl ChildExt for Child {
    async fn terminate(&mut self, grace_period: Duration) -> anyhow::Result<()> {
        // No ID means it's already been reaped.
        let Some(id) = self.id() else {
            return Ok(());
        };
        let pgid = Pid::from_raw(id.try_into().context("couldn't parse child PID")?);
        match killpg(pgid, Signal::SIGTERM) {
            Ok(()) => {
                if timeout(grace_period, self.wait()).await.is_err() {
                    debug!("group {pgid} survived SIGTERM for {grace_period:?}, killing");
                }
            }
            Err(e) => warn!("couldn't SIGTERM group {pgid}: {e}"),
        }
        // Even if the leader exited, its children can still be around.
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("couldn't SIGKILL group {pgid}: {e}"),
        }
        self.wait().await.context("couldn't reap child")?;
        Ok(())
    }
}
