//! Every state reaches DONE once the other side goes away.

use std::time::{Duration, Instant};

use plugin_message::Message;
use plugin_pipe::MessagePipe;
use tokio::net::TcpListener;

use super::harness::{
    loopback_ready, stub_received, test_child_options, test_parent_options, PluginPair,
    StubLoader, SCENARIO_TIMEOUT,
};
use crate::child::{ChildState, ProcessChild};
use crate::parent::{ParentEvent, ParentState};

/// A child connected to a bare host pipe the test controls.
async fn connected_child() -> (ProcessChild<StubLoader>, MessagePipe) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut child = ProcessChild::new(StubLoader, test_child_options());
    child.init(port);
    child.idle().await;
    assert_eq!(child.state(), ChildState::Connected);

    let (stream, _) = listener.accept().await.unwrap();
    (child, MessagePipe::from_stream(stream).unwrap())
}

async fn run_child_until(
    child: &mut ProcessChild<StubLoader>,
    mut host: Option<&mut MessagePipe>,
    state: ChildState,
) -> bool {
    let deadline = Instant::now() + SCENARIO_TIMEOUT;
    while Instant::now() < deadline {
        if child.state() == state {
            return true;
        }
        child.idle().await;
        child.pump(Duration::from_millis(1)).await;
        if let Some(host) = host.as_deref_mut() {
            let _ = host.pump(Duration::from_millis(1)).await;
        }
    }
    child.state() == state
}

async fn load_stub(child: &mut ProcessChild<StubLoader>, host: &mut MessagePipe) {
    let mut load = Message::new("internal", "load_plugin");
    load.set_value("dir", "");
    load.set_value("file", "stub");
    host.send(&load);
    assert!(run_child_until(child, Some(host), ChildState::Running).await);
}

#[tokio::test]
async fn child_finishes_when_host_vanishes_before_load() {
    if !loopback_ready() {
        return;
    }
    let (mut child, host) = connected_child().await;
    drop(host);

    assert!(run_child_until(&mut child, None, ChildState::Done).await);
    assert!(child.failed());
}

#[tokio::test]
async fn child_finishes_when_host_vanishes_while_running() {
    if !loopback_ready() {
        return;
    }
    let (mut child, mut host) = connected_child().await;
    load_stub(&mut child, &mut host).await;
    drop(host);

    assert!(run_child_until(&mut child, None, ChildState::Done).await);
    assert!(child.failed());
    assert_eq!(child.region_count(), 0);
    assert!(stub_received().contains(&"base.cleanup".to_string()));
}

#[tokio::test]
async fn child_finishes_when_host_vanishes_while_blocked() {
    if !loopback_ready() {
        return;
    }
    let (mut child, mut host) = connected_child().await;
    load_stub(&mut child, &mut host).await;

    host.send(&Message::new("test", "request_pick"));
    let deadline = Instant::now() + SCENARIO_TIMEOUT;
    while !child.is_blocked() && Instant::now() < deadline {
        let _ = host.pump(Duration::from_millis(1)).await;
        child.pump(Duration::from_millis(1)).await;
        child.idle().await;
    }
    assert!(child.is_blocked());
    drop(host);

    assert!(run_child_until(&mut child, None, ChildState::Done).await);
}

#[tokio::test]
async fn host_reports_a_child_that_never_connects() {
    if !loopback_ready() {
        return;
    }
    let mut options = test_parent_options();
    options.launch_timeout = Duration::from_millis(100);
    let mut pair = PluginPair::with_options(options, test_child_options());
    pair.child.spawn = false;
    pair.parent.init("", "stub");

    assert!(pair.run_until(|pair| pair.parent.is_done()).await);
    assert_eq!(pair.events, vec![ParentEvent::LaunchFailed]);
}

#[tokio::test]
async fn host_reports_a_child_that_exits_before_connecting() {
    if !loopback_ready() {
        return;
    }
    let mut pair = PluginPair::new();
    pair.parent.init("", "stub");
    pair.child.kill();

    assert!(pair.run_until(|pair| pair.parent.is_done()).await);
    assert_eq!(pair.events, vec![ParentEvent::LaunchFailed]);
}

#[tokio::test]
async fn host_reports_a_child_killed_after_connecting() {
    if !loopback_ready() {
        return;
    }
    let mut pair = PluginPair::new();
    pair.parent.init("", "stub");
    let connected = pair
        .run_until(|pair| {
            pair.child
                .get()
                .is_some_and(|child| child.state() == ChildState::Connected)
        })
        .await;
    assert!(connected);
    pair.child.kill();

    assert!(pair.run_until(|pair| pair.parent.is_done()).await);
    assert_eq!(pair.events, vec![ParentEvent::Died]);
}

#[tokio::test]
async fn host_reports_a_failed_load() {
    if !loopback_ready() {
        return;
    }
    let mut pair = PluginPair::new();
    pair.parent.init("/plugins", "missing");

    let child_done = pair
        .run_until(|pair| pair.child.get().is_some_and(ProcessChild::is_done))
        .await;
    assert!(child_done);
    assert!(pair.child.get().unwrap().failed());

    assert!(pair.run_until(|pair| pair.parent.is_done()).await);
    assert_eq!(pair.events, vec![ParentEvent::Died]);
}

#[tokio::test]
async fn host_reports_a_child_killed_while_running() {
    if !loopback_ready() {
        return;
    }
    let mut pair = PluginPair::new();
    assert!(pair.start().await);
    pair.child.kill();

    assert!(pair.run_until(|pair| pair.parent.is_done()).await);
    assert_eq!(pair.events, vec![ParentEvent::Died]);
}

#[tokio::test]
async fn host_notices_a_closed_pipe_in_one_idle() {
    if !loopback_ready() {
        return;
    }
    let mut pair = PluginPair::new();
    assert!(pair.start().await);
    pair.child.kill();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(pair.parent.idle().await, vec![ParentEvent::Died]);
    assert!(pair.parent.is_done());
}

#[tokio::test]
async fn host_times_out_a_stuck_load() {
    if !loopback_ready() {
        return;
    }
    let mut options = test_parent_options();
    options.load_timeout = Duration::from_millis(150);
    let mut pair = PluginPair::with_options(options, test_child_options());
    pair.parent.init("", "stub");

    assert!(pair.run_until(|pair| pair.parent.state() == ParentState::Loading).await);
    pair.child.frozen = true;

    assert!(pair.run_until(|pair| pair.parent.is_done()).await);
    assert_eq!(pair.events, vec![ParentEvent::Died]);
}

#[tokio::test]
async fn host_detects_a_hung_child() {
    if !loopback_ready() {
        return;
    }
    let mut options = test_parent_options();
    options.lockup_timeout = Duration::from_millis(150);
    let mut pair = PluginPair::with_options(options, test_child_options());
    assert!(pair.start().await);

    pair.run_for(Duration::from_millis(300)).await;
    assert!(pair.parent.is_running(), "healthy child flagged as hung");

    pair.child.frozen = true;
    assert!(pair.run_until(|pair| pair.parent.is_done()).await);
    assert_eq!(pair.events, vec![ParentEvent::Died]);
}
