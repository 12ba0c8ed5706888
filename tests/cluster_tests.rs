//! Multi-process tests against the `wsgilite-demo` binary.
//!
//! # Test Coverage
//!
//! - A master with workers serves on one address and answers delegations
//! - SIGTERM to the master stops the whole pool
//! - Workers are replaced after a route timeout and after their serve limit
//! - A worker can terminate the pool
//!
//! Every test starts its own master on a fresh port; the guard kills it if a
//! test fails halfway so no process outlives the test.

#![cfg(unix)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

mod common;

struct Master {
    child: Child,
    addr: SocketAddr,
}

impl Master {
    fn start(extra: &[&str]) -> Master {
        let addr: SocketAddr = format!("127.0.0.1:{}", common::free_port()).parse().unwrap();
        let child = Command::new(env!("CARGO_BIN_EXE_wsgilite-demo"))
            .arg("--addr")
            .arg(addr.to_string())
            .args(extra)
            .env("WSGILITE_LOG_LEVEL", "warn")
            .env("WSGILITE_SHUTDOWN_GRACE_MS", "500")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to start demo binary");
        let master = Master { child, addr };
        common::wait_for_server(addr, "/", 100).expect("demo server did not come up");
        master
    }

    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn signal(&self, signal: i32) {
        let rc = unsafe { libc::kill(self.pid() as libc::pid_t, signal) };
        assert_eq!(rc, 0, "kill failed");
    }

    fn wait_exit(&mut self, limit: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if let Some(status) = self.child.try_wait().unwrap() {
                return Some(status);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        None
    }

    /// GET until a non-error answer, tolerating the gap while a worker is
    /// being replaced.
    fn get(&self, path: &str) -> common::HttpResponse {
        common::wait_for_server(self.addr, path, 100).expect("no answer from pool")
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn served_by(response: &common::HttpResponse) -> u32 {
    response
        .header("x-served-by")
        .and_then(|pid| pid.parse().ok())
        .expect("missing x-served-by")
}

#[test]
fn test_workers_delegate_to_master() {
    let master = Master::start(&["--processes", "2"]);

    let response = master.get("/delegate");
    assert_eq!(response.status, 200, "{}", response.body);
    let body = response.json();
    let worker_pid = body["worker_pid"].as_u64().unwrap() as u32;
    assert_ne!(worker_pid, master.pid());
    assert_eq!(body["results"][0]["master_pid"], master.pid());
    assert_eq!(body["results"][0]["op"], "whoami");
    assert!(body["results"][0]["origin"].as_u64().is_some());
    assert_eq!(served_by(&response), worker_pid);
}

#[test]
fn test_sigterm_stops_pool() {
    let mut master = Master::start(&["--processes", "2"]);
    master.signal(libc::SIGTERM);
    let status = master
        .wait_exit(Duration::from_secs(15))
        .expect("master did not exit after SIGTERM");
    assert!(status.success(), "{status:?}");
    assert!(common::blocking_get(master.addr, "/").is_err());
}

#[test]
fn test_hard_exit_stops_pool() {
    let mut master = Master::start(&["--processes", "2", "--hard-exit"]);
    master.signal(libc::SIGINT);
    let status = master
        .wait_exit(Duration::from_secs(15))
        .expect("master did not exit after SIGINT");
    assert!(status.success(), "{status:?}");
}

#[test]
fn test_route_timeout_replaces_worker() {
    let master = Master::start(&["--processes", "1", "--timeout-ms", "100"]);
    let before = served_by(&master.get("/"));

    let timed_out = master.get("/slow?ms=3000");
    assert_eq!(timed_out.status, 504);
    assert_eq!(timed_out.body, "too slow");

    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let pid = served_by(&master.get("/"));
        if pid != before {
            break;
        }
        assert!(Instant::now() < deadline, "worker {before} was never replaced");
        std::thread::sleep(Duration::from_millis(100));
    }
}

#[test]
fn test_serve_limit_rotates_workers() {
    let master = Master::start(&["--processes", "1", "--serve-limit", "2"]);
    let mut pids = HashSet::new();
    let deadline = Instant::now() + Duration::from_secs(15);
    while pids.len() < 2 {
        assert!(Instant::now() < deadline, "worker never rotated: {pids:?}");
        let response = master.get("/");
        if response.status == 200 {
            pids.insert(served_by(&response));
        }
    }
    assert!(!pids.contains(&master.pid()));
}

#[test]
fn test_worker_can_terminate_pool() {
    let mut master = Master::start(&["--processes", "2"]);
    // The answering worker may be told to exit before its reply is flushed.
    drop(common::blocking_get(master.addr, "/terminate"));
    let status = master
        .wait_exit(Duration::from_secs(15))
        .expect("master did not exit after terminate request");
    assert!(status.success(), "{status:?}");
}
