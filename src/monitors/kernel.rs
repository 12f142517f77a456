//! Kernel health monitor.
//!
//! Watches the kernel ring buffer and the kubelet journal for known failure
//! signatures, and periodically checks file descriptor usage against the
//! kernel limit. All findings are pushed through the manager handle; the
//! polled snapshot is always empty.

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::monitor::{resource, Condition, ManagerHandle, Monitor};
use crate::reasons;
use crate::util;

const FILE_NR_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Fraction of the file handle limit above which a warning is emitted.
const FILE_NR_WARN_RATIO: f64 = 0.7;

static KERNEL_BUG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[.*?] BUG: (.*)").unwrap());
static SOFT_LOCKUP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"watchdog: BUG: soft lockup - .* stuck for (.*)! \[(.*?).*\]").unwrap()
});
// Each alternative captures the crashing process name.
static APP_CRASH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"traps:\s*(.*?)\[|\s(.*?)\[\d+]: segfault at.*").unwrap());
static APP_BLOCKED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"task (.*?):\d+ blocked for more than").unwrap());
static CONNTRACK_EXCEEDED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(ip|nf)_conntrack: table full, dropping packet").unwrap());

static FORK_FAILED_OUT_OF_PIDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r".*fork/exec.*resource temporarily unavailable").unwrap());
static GO_RUNTIME_OUT_OF_PIDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"failed to create new OS thread.*errno=11").unwrap());

pub struct KernelMonitor {
    file_nr_path: PathBuf,
}

impl KernelMonitor {
    pub fn new(host_root: impl Into<PathBuf>) -> Self {
        KernelMonitor {
            file_nr_path: host_root.into().join("proc/sys/fs/file-nr"),
        }
    }
}

/// Maps one kernel ring buffer line to a condition.
fn parse_dmesg_line(line: &str) -> Option<Condition> {
    if let Some(captures) = SOFT_LOCKUP.captures(line) {
        let duration = &captures[1];
        return Some(
            reasons::SOFT_LOCKUP
                .builder()
                .message(format!("CPU stuck for {}", duration))
                .build(),
        );
    }
    if KERNEL_BUG.is_match(line) {
        return Some(
            reasons::KERNEL_BUG
                .builder()
                .message("A kernel bug was detected and reported by the Linux kernel")
                .build(),
        );
    }
    if let Some(captures) = APP_CRASH.captures(line) {
        let process = captures
            .get(1)
            .or_else(|| captures.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        return Some(
            reasons::APP_CRASH
                .builder()
                .message(format!("Process {:?} on the node has crashed", process))
                .build(),
        );
    }
    if let Some(captures) = APP_BLOCKED.captures(line) {
        let process = &captures[1];
        return Some(
            reasons::APP_BLOCKED
                .builder()
                .message(format!(
                    "Process {:?} has been blocked from scheduling for a long period of time",
                    process
                ))
                .build(),
        );
    }
    if CONNTRACK_EXCEEDED.is_match(line) {
        return Some(
            reasons::CONNTRACK_EXCEEDED_KERNEL
                .builder()
                .message("Connection tracking exceeded the maximum for the kernel")
                .build(),
        );
    }
    None
}

/// Maps one kubelet journal line to a condition.
fn parse_kubelet_line(line: &str) -> Option<Condition> {
    if FORK_FAILED_OUT_OF_PIDS.is_match(line) || GO_RUNTIME_OUT_OF_PIDS.is_match(line) {
        return Some(
            reasons::FORK_FAILED_OUT_OF_PIDS
                .builder()
                .message(
                    "A fork or exec call has failed due to the system being out of \
                     process IDs or memory",
                )
                .build(),
        );
    }
    None
}

/// Evaluates the contents of `file-nr` (allocated, unused, maximum) and
/// returns a warning condition when usage is at or above the ratio threshold.
fn check_file_descriptors(contents: &str) -> anyhow::Result<Option<Condition>> {
    let fields: Vec<&str> = contents.split_whitespace().collect();
    let &[allocated, _, maximum] = fields.as_slice() else {
        anyhow::bail!("expected three fields in file-nr contents: {:?}", contents);
    };
    let allocated: f64 = allocated.parse()?;
    let maximum: f64 = maximum.parse()?;
    let used = allocated / maximum;
    if used < FILE_NR_WARN_RATIO {
        return Ok(None);
    }
    Ok(Some(
        reasons::APPROACHING_MAX_OPEN_FILES
            .builder()
            .message(format!(
                "Approaching Exhaustion of max open file descriptors. {:.0} of {:.0} total, {:.1}%",
                allocated,
                maximum,
                used * 100.0
            ))
            .build(),
    ))
}

#[async_trait]
impl Monitor for KernelMonitor {
    fn name(&self) -> &str {
        "kernel"
    }

    fn conditions(&self) -> Vec<Condition> {
        Vec::new()
    }

    async fn register(
        &self,
        shutdown: CancellationToken,
        handle: Arc<dyn ManagerHandle>,
    ) -> anyhow::Result<()> {
        let dmesg = handle.subscribe(resource::DMESG, &[])?;
        let kubelet = handle.subscribe(resource::JOURNAL, &["kubelet".to_string()])?;

        let dmesg_handle = Arc::clone(&handle);
        util::spawn_subscription_handler(dmesg, shutdown.clone(), move |line| {
            let handle = Arc::clone(&dmesg_handle);
            async move {
                if let Some(condition) = parse_dmesg_line(&line) {
                    if let Err(err) = handle.notify(condition).await {
                        warn!("kernel: failed to notify dmesg condition: {}", err);
                    }
                }
            }
        });

        let kubelet_handle = Arc::clone(&handle);
        util::spawn_subscription_handler(kubelet, shutdown.clone(), move |line| {
            let handle = Arc::clone(&kubelet_handle);
            async move {
                if let Some(condition) = parse_kubelet_line(&line) {
                    if let Err(err) = handle.notify(condition).await {
                        warn!("kernel: failed to notify kubelet condition: {}", err);
                    }
                }
            }
        });

        let file_nr_path = self.file_nr_path.clone();
        tokio::spawn(async move {
            let mut ticker = util::jittered_interval(FILE_NR_CHECK_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let contents = match tokio::fs::read_to_string(&file_nr_path).await {
                    Ok(contents) => contents,
                    Err(err) => {
                        warn!(
                            "kernel: failed to read {}: {}",
                            file_nr_path.display(),
                            err
                        );
                        continue;
                    }
                };
                match check_file_descriptors(&contents) {
                    Ok(Some(condition)) => {
                        if handle.notify(condition).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => warn!("kernel: failed to check file descriptors: {}", err),
                }
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::Severity;

    #[test]
    fn test_soft_lockup_detected() {
        let condition = parse_dmesg_line(
            "watchdog: BUG: soft lockup - CPU#6 stuck for 23s! [VM Thread:4054]",
        )
        .unwrap();
        assert_eq!(condition.reason, "SoftLockup");
        assert_eq!(condition.severity, Severity::Warning);
        assert_eq!(condition.message, "CPU stuck for 23s");
    }

    #[test]
    fn test_kernel_bug_detected() {
        let condition = parse_dmesg_line(
            "[  123.456789] BUG: unable to handle page fault for address: 00000000deadbeef",
        )
        .unwrap();
        assert_eq!(condition.reason, "KernelBug");
    }

    #[test]
    fn test_segfault_detected_with_process_name() {
        let condition = parse_dmesg_line(
            "[   32.298491][  T896] kexec[896]: segfault at 0 ip 0000000000000000 \
             sp 00007ffeaf0ff420 error 14 in dash[561ac3c57000+4000]",
        )
        .unwrap();
        assert_eq!(condition.reason, "AppCrash");
        assert!(condition.message.contains("kexec"));
    }

    #[test]
    fn test_traps_detected() {
        let condition =
            parse_dmesg_line("traps: myapp[1234] general protection fault").unwrap();
        assert_eq!(condition.reason, "AppCrash");
        assert!(condition.message.contains("myapp"));
    }

    #[test]
    fn test_blocked_task_detected() {
        let condition = parse_dmesg_line("task foo:123 blocked for more than 20s").unwrap();
        assert_eq!(condition.reason, "AppBlocked");
        assert!(condition.message.contains("foo"));
    }

    #[test]
    fn test_conntrack_exhaustion_detected() {
        let condition =
            parse_dmesg_line("nf_conntrack: nf_conntrack: table full, dropping packet")
                .unwrap();
        assert_eq!(condition.reason, "ConntrackExceededKernel");
        assert_eq!(condition.severity, Severity::Warning);
    }

    #[test]
    fn test_healthy_dmesg_line_ignored() {
        assert!(parse_dmesg_line("usb 1-1: new high-speed USB device number 2").is_none());
    }

    #[test]
    fn test_fork_failure_detected_in_kubelet_log() {
        let condition = parse_kubelet_line(
            r#"err="fork/exec /usr/bin/runc: resource temporarily unavailable""#,
        )
        .unwrap();
        assert_eq!(condition.reason, "ForkFailedOutOfPIDs");
        assert_eq!(condition.severity, Severity::Fatal);
    }

    #[test]
    fn test_thread_exhaustion_detected_in_kubelet_log() {
        let condition =
            parse_kubelet_line("failed to create new OS thread (foo; errno=11)").unwrap();
        assert_eq!(condition.reason, "ForkFailedOutOfPIDs");
    }

    #[test]
    fn test_ordinary_kubelet_line_ignored() {
        assert!(parse_kubelet_line("Started kubelet.service").is_none());
    }

    #[test]
    fn test_file_descriptors_below_threshold() {
        let result = check_file_descriptors("4608\t0\t9223372036854775807\n").unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_file_descriptors_above_threshold() {
        let condition = check_file_descriptors("800\t0\t1000\n").unwrap().unwrap();
        assert_eq!(condition.reason, "ApproachingMaxOpenFiles");
        assert_eq!(condition.severity, Severity::Warning);
        assert!(condition.message.contains("80.0%"));
    }

    #[test]
    fn test_file_descriptors_at_threshold() {
        assert!(check_file_descriptors("700 0 1000").unwrap().is_some());
    }

    #[test]
    fn test_file_descriptors_malformed_contents() {
        assert!(check_file_descriptors("garbage").is_err());
        assert!(check_file_descriptors("1 2").is_err());
    }
}
