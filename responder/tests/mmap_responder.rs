use std::error::Error;
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tempfile::tempdir;

use shmem::core::{OwnershipFlag, ShmemConfig};
use shmem::driver::{DriverConfig, MmapSession, PingPong};
use shmem::ShmemLibError;

type TestResult = Result<(), Box<dyn Error>>;

fn responder() -> &'static Path {
    Path::new(env!("CARGO_BIN_EXE_mmap-responder"))
}

fn spawn() -> shmem::Result<MmapSession> {
    MmapSession::spawn(responder(), &ShmemConfig::default(), &DriverConfig::default())
}

#[test]
fn ping_pong_then_quit() -> TestResult {
    let mut session = Box::new(spawn()?);
    for i in 0..5 {
        let reply = session.round_trip("ping")?;
        assert_eq!(reply, "pong", "round trip {}", i);
    }
    let status = session.shutdown()?;
    assert!(status.success());
    Ok(())
}

#[test]
fn every_ping_gets_exactly_one_pong() -> TestResult {
    let mut session = spawn()?;
    for _ in 0..10_000 {
        session.ping()?;
    }
    assert_eq!(session.flag(), Some(OwnershipFlag::ResponderOwnsBuffer));
    Box::new(session).shutdown()?;
    Ok(())
}

#[test]
fn unknown_command_keeps_session_alive() -> TestResult {
    let mut session = spawn()?;
    assert_eq!(session.round_trip("status")?, "");
    assert_eq!(session.flag(), Some(OwnershipFlag::ResponderOwnsBuffer));
    session.ping()?;
    Box::new(session).shutdown()?;
    Ok(())
}

#[test]
fn quit_leaves_request_pending() -> TestResult {
    let mut session = spawn()?;
    session.ping()?;
    session.send_quit()?;
    let status = session.wait_for_exit(Duration::from_secs(2))?;
    assert_eq!(status.code(), Some(0));
    assert_eq!(session.flag(), Some(OwnershipFlag::RequestPending));
    Ok(())
}

#[cfg(unix)]
fn signal(pid: u32, name: &str) -> TestResult {
    let status = Command::new("kill")
        .arg(format!("-{}", name))
        .arg(pid.to_string())
        .status()?;
    assert!(status.success(), "kill -{} {}", name, pid);
    Ok(())
}

#[cfg(unix)]
#[test]
fn killed_responder_fails_the_round_trip() -> TestResult {
    let mut session = spawn()?;
    session.ping()?;
    signal(session.responder_pid(), "KILL")?;

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(session.round_trip("ping"));
    });
    match rx.recv_timeout(Duration::from_secs(5))? {
        Err(ShmemLibError::ResponderFailed(status)) => assert!(!status.success()),
        other => panic!("expected ResponderFailed, got {:?}", other),
    }
    Ok(())
}

#[cfg(unix)]
#[test]
fn terminated_responder_disconnects_the_session() -> TestResult {
    let mut session = spawn()?;
    session.ping()?;
    signal(session.responder_pid(), "TERM")?;
    // SIGTERM is a graceful stop: exit 0 with the buffer still handed to the driver.
    assert!(session.wait_for_exit(Duration::from_secs(5))?.success());
    assert_eq!(session.flag(), Some(OwnershipFlag::ResponderOwnsBuffer));

    assert!(matches!(session.round_trip("ping"), Err(ShmemLibError::Disconnected)));
    Ok(())
}

#[test]
fn quit_right_after_handshake() -> TestResult {
    let session = spawn()?;
    let status = Box::new(session).shutdown()?;
    assert!(status.success());
    Ok(())
}

#[test]
fn oversized_request_is_truncated_not_fatal() -> TestResult {
    let mut session = spawn()?;
    let request = "x".repeat(100);
    assert_eq!(session.round_trip(&request)?, "");
    session.ping()?;
    Box::new(session).shutdown()?;
    Ok(())
}

#[test]
fn segment_file_is_removed_with_session() -> TestResult {
    let session = spawn()?;
    let path = session.segment_path().to_path_buf();
    assert_eq!(fs::metadata(&path)?.len(), shmem::PAGE_SIZE as u64);
    Box::new(session).shutdown()?;
    assert!(!path.exists());
    Ok(())
}

#[cfg(target_os = "linux")]
#[test]
fn dropping_a_session_kills_the_responder() -> TestResult {
    let session = spawn()?;
    let proc_dir = format!("/proc/{}", session.responder_pid());
    assert!(Path::new(&proc_dir).exists());
    drop(session);
    assert!(!Path::new(&proc_dir).exists());
    Ok(())
}

#[test]
fn responder_reads_layout_from_config() -> TestResult {
    let dir = tempdir()?;
    let config_path = dir.path().join("responder.toml");
    fs::write(
        &config_path,
        "page_size = 4096\n\
         flag_offset = 8\n\
         message_offset = 256\n\
         message_len = 16\n\
         \n\
         [spin]\n\
         spin_iterations = 0\n\
         yield_interval_ns = 1000\n",
    )?;
    let shmem_cfg = ShmemConfig {
        flag_offset: 8,
        message_offset: 256,
        message_len: 16,
        ..Default::default()
    };
    let driver_cfg = DriverConfig {
        responder_args: vec!["--config".to_string(), config_path.display().to_string()],
        ..Default::default()
    };
    let mut session = Box::new(MmapSession::spawn(responder(), &shmem_cfg, &driver_cfg)?);
    for _ in 0..100 {
        session.ping()?;
    }
    assert!(session.shutdown()?.success());
    Ok(())
}

#[test]
fn missing_segment_exits_non_zero() -> TestResult {
    let dir = tempdir()?;
    let status = Command::new(responder())
        .arg(dir.path().join("missing.mem"))
        .stderr(Stdio::null())
        .status()?;
    assert!(!status.success());
    Ok(())
}

#[test]
fn short_segment_exits_non_zero() -> TestResult {
    let dir = tempdir()?;
    let path = dir.path().join("short.mem");
    fs::write(&path, [0u8; 64])?;
    let status = Command::new(responder())
        .arg(&path)
        .stderr(Stdio::null())
        .status()?;
    assert!(!status.success());
    Ok(())
}

#[test]
fn missing_argument_exits_non_zero() -> TestResult {
    let status = Command::new(responder())
        .stderr(Stdio::null())
        .status()?;
    assert!(!status.success());
    Ok(())
}
