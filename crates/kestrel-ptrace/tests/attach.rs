// Once clippy takes `clippy.toml` into account (for `tests` targets),
// we can remove these.
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(missing_docs)]
#![cfg(target_os = "linux")]

use std::process::{Child, Command};
use std::time::Duration;

use kestrel_ptrace::{Error, PtraceProcess};
use kestrel_target::{
    MemoryAccess, ProcessHandle, RegisterState, StateKind, TargetEvent, ThreadHandle,
    ThreadRunState,
};
use nix::errno::Errno;
use test_log::test;

fn spawn_sleeper() -> Child {
    Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("spawn sleep")
}

/// Attaches to the child, or returns `None` when ptrace is not permitted here.
async fn attach(child: &Child) -> Option<PtraceProcess> {
    match PtraceProcess::attach(u64::from(child.id())).await {
        Ok(process) => Some(process),
        Err(Error::Os(Errno::EPERM)) => {
            tracing::warn!("ptrace not permitted, skipping");
            None
        }
        Err(e) => panic!("attach: {e}"),
    }
}

#[test(tokio::test)]
async fn attach_inspect_and_kill() {
    let mut child = spawn_sleeper();

    let Some(mut process) = attach(&child).await else {
        let _ = child.kill();
        return;
    };

    assert_eq!(process.koid(), u64::from(child.id()));
    assert_eq!(process.name(), "sleep");

    let threads = process.threads().expect("threads");
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].koid(), process.koid());

    let modules = process.modules().await.expect("modules");
    let sleep = modules
        .iter()
        .find(|module| module.name == "sleep")
        .expect("sleep module");

    let mut magic = [0u8; 4];
    let len = process.read_memory(sleep.base, &mut magic).expect("read memory");
    assert_eq!(len, 4);
    assert_eq!(&magic, b"\x7fELF");

    let _watch = process.watch_exceptions().expect("watch");
    let mut pump = process.event_pump();

    process.kill().expect("kill");

    let terminated = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = pump.next_event().await {
            if let TargetEvent::ProcessTerminated { return_code, .. } = event {
                return Some(return_code);
            }
        }
        None
    })
    .await
    .expect("termination timeout");

    assert_eq!(terminated, Some(-9));
    assert!(pump.next_event().await.is_none());
}

#[test(tokio::test)]
async fn suspend_and_read_registers() {
    let mut child = spawn_sleeper();

    let Some(mut process) = attach(&child).await else {
        let _ = child.kill();
        return;
    };

    let mut thread = process.threads().expect("threads").remove(0);
    assert_eq!(thread.run_state().expect("run state"), ThreadRunState::Running);
    assert!(thread.read_state(StateKind::General).is_err());

    let token = thread.suspend().expect("suspend");
    let suspended = thread
        .wait_suspended(Duration::from_secs(5))
        .await
        .expect("wait suspended");

    assert!(suspended);
    assert_eq!(thread.run_state().expect("run state"), ThreadRunState::Suspended);

    let general = thread.read_state(StateKind::General).expect("general registers");
    assert!(!general.is_empty());
    thread
        .write_state(StateKind::General, &general)
        .expect("write back general registers");

    drop(token);
    assert_eq!(thread.run_state().expect("run state"), ThreadRunState::Running);

    drop(thread);
    drop(process);

    // detached, the process can be reaped normally
    child.kill().expect("kill");
    child.wait().expect("wait");
}

#[test(tokio::test)]
async fn out_of_range_pid_is_rejected() {
    for pid in [0, u64::from(u32::MAX) + 1, u64::MAX] {
        let err = PtraceProcess::attach(pid).await.err().expect("attach error");

        assert!(matches!(err, Error::Os(Errno::EINVAL)));
        assert!(matches!(
            kestrel_target::Error::from(err),
            kestrel_target::Error::InvalidArgs
        ));
    }
}
