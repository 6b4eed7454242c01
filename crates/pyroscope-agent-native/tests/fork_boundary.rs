//! Fork boundary tests
//!
//! Real `fork()` calls: the child reports its findings through its exit code, the
//! parent asserts on it. Children leave with `_exit` so the test harness never runs
//! twice.

mod common;

use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use common::mocks::RecordingSampler;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use pyroscope_agent_native::agent::{Agent, AgentState};
use pyroscope_agent_native::config::{resolve, RawConfig};
use pyroscope_agent_native::fork::{ForkAction, ForkBoundary};
use pyroscope_agent_native::tags::context::FixedContextProvider;
use pyroscope_agent_native::tags::scope::with_tags;
use pyroscope_agent_native::tags::{ExecutionContextId, Tag};
use serial_test::serial;

const CHILD_OK: i32 = 0;
const CHILD_FAILED: i32 = 3;

/// Forks; the child runs `child` and exits with its verdict, the parent gets the pid.
fn spawn_child(child: impl FnOnce() -> bool) -> Pid {
    // SAFETY: the child only touches this crate's state and leaves through `_exit`.
    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            let code = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(child)) {
                Ok(true) => CHILD_OK,
                _ => CHILD_FAILED,
            };
            // SAFETY: terminates the child without running the parent's atexit handlers.
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => child,
    }
}

fn wait_child(pid: Pid) -> i32 {
    match waitpid(pid, None).unwrap() {
        WaitStatus::Exited(_, code) => code,
        other => panic!("child did not exit normally: {other:?}"),
    }
}

/// Runs `child` in a forked process and returns its exit code.
fn in_child(child: impl FnOnce() -> bool) -> i32 {
    wait_child(spawn_child(child))
}

fn running_agent(detect_subprocesses: bool) -> (Agent, std::sync::Arc<RecordingSampler>) {
    let sampler = RecordingSampler::new();
    let agent = Agent::new(sampler.clone());
    let mut tags = std::collections::BTreeMap::new();
    tags.insert("region".to_string(), "us-east".to_string());
    agent
        .initialize(resolve(&RawConfig {
            application_name: Some("forking".to_string()),
            detect_subprocesses: Some(detect_subprocesses),
            tags: Some(tags),
            ..RawConfig::default()
        }))
        .unwrap();
    (agent, sampler)
}

#[test]
#[serial]
fn test_child_without_detect_subprocesses_never_starts() {
    let (agent, sampler) = running_agent(false);
    assert_eq!(sampler.starts(), 1);

    let code = in_child(|| {
        let action = agent.handle_fork();
        action == Some(ForkAction::Inert)
            && sampler.starts() == 1
            && sampler.resets.load(Ordering::SeqCst) == 1
            && agent.state() == AgentState::Stopped
            && agent.handle_fork().is_none()
    });
    assert_eq!(code, CHILD_OK);

    // The parent is untouched.
    assert_eq!(agent.handle_fork(), None);
    assert_eq!(agent.state(), AgentState::Running);
    agent.stop().unwrap();
}

#[test]
#[serial]
fn test_child_with_detect_subprocesses_restarts() {
    let (agent, sampler) = running_agent(true);

    let code = in_child(|| {
        let action = agent.handle_fork();
        action == Some(ForkAction::Restart)
            && sampler.starts() == 2
            && agent.state() == AgentState::Running
    });
    assert_eq!(code, CHILD_OK);

    assert_eq!(sampler.starts(), 1);
    agent.stop().unwrap();
}

#[test]
#[serial]
fn test_failed_restart_is_isolated_to_child() {
    let (agent, sampler) = running_agent(true);
    sampler.fail_start.store(true, Ordering::SeqCst);

    let code = in_child(|| {
        agent.handle_fork() == Some(ForkAction::Restart) && agent.state() == AgentState::Stopped
    });
    assert_eq!(code, CHILD_OK);

    sampler.fail_start.store(false, Ordering::SeqCst);
    assert_eq!(agent.state(), AgentState::Running);
    agent.stop().unwrap();
}

#[test]
#[serial]
fn test_parent_and_child_tags_diverge() {
    let (agent, _sampler) = running_agent(true);
    let context = ExecutionContextId::new(4_242);
    agent.tags().add_tag(context, "inherited", "yes").unwrap();

    let child = {
        let tags = std::sync::Arc::clone(agent.tags());
        spawn_child(move || {
            tags.add_tag(context, "fork", "forked").unwrap();
            thread::sleep(Duration::from_millis(50));
            let snapshot = tags.snapshot(context);
            snapshot.contains(&Tag::new("inherited", "yes"))
                && snapshot.contains(&Tag::new("fork", "forked"))
                && !snapshot.contains(&Tag::new("fork", "master"))
        })
    };

    agent.tags().add_tag(context, "fork", "master").unwrap();
    thread::sleep(Duration::from_millis(50));
    let snapshot = agent.tags().snapshot(context);
    assert!(snapshot.contains(&Tag::new("fork", "master")));
    assert!(!snapshot.contains(&Tag::new("fork", "forked")));
    assert_eq!(wait_child(child), CHILD_OK);

    agent.tags().clear_context(context);
    agent.stop().unwrap();
}

#[test]
#[serial]
fn test_recorded_fork_without_real_fork() {
    let (agent, sampler) = running_agent(false);

    ForkBoundary::record_fork();
    assert_eq!(agent.handle_fork(), Some(ForkAction::Inert));
    assert_eq!(agent.handle_fork(), None);
    assert_eq!(sampler.starts(), 1);
    assert_eq!(agent.state(), AgentState::Stopped);
}

#[test]
#[serial]
fn test_child_that_only_tags_restarts() {
    let (agent, sampler) = running_agent(true);
    let store = std::sync::Arc::clone(agent.tags());
    let provider = FixedContextProvider(ExecutionContextId::new(31));

    let code = in_child(|| {
        let tagged = with_tags(&store, &provider, [("fork", "child")], || {
            store.snapshot(provider.0).contains(&Tag::new("fork", "child"))
        });
        // Checked through the sampler alone: asking the agent would apply the
        // decision itself.
        tagged.unwrap_or(false) && sampler.starts() == 2
    });
    assert_eq!(code, CHILD_OK);

    assert_eq!(sampler.starts(), 1);
    assert_eq!(agent.state(), AgentState::Running);
    agent.stop().unwrap();
}

#[test]
#[serial]
fn test_child_that_only_tags_stays_inert() {
    let (agent, sampler) = running_agent(false);
    let store = std::sync::Arc::clone(agent.tags());
    let provider = FixedContextProvider(ExecutionContextId::new(32));

    let code = in_child(|| {
        let snapshot = with_tags(&store, &provider, [("fork", "child")], || {
            store.snapshot(provider.0)
        })
        .unwrap_or_default();
        snapshot == vec![Tag::new("fork", "child")]
            && sampler.starts() == 1
            && agent.state() == AgentState::Stopped
    });
    assert_eq!(code, CHILD_OK);

    assert_eq!(store.global_tags(), vec![Tag::new("region", "us-east")]);
    agent.stop().unwrap();
}

#[test]
#[serial]
fn test_inert_child_drops_configured_tags() {
    let (agent, sampler) = running_agent(false);

    let code = in_child(|| {
        agent.state() == AgentState::Stopped
            && sampler.starts() == 1
            && agent.tags().global_tags().is_empty()
    });
    assert_eq!(code, CHILD_OK);

    assert_eq!(agent.tags().global_tags(), vec![Tag::new("region", "us-east")]);
    agent.stop().unwrap();
}
