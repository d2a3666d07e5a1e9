//! SCP file transfer
//!
//! Single files go over one scp channel in fixed-size chunks. Wildcard
//! batches are planned first (remote names come from an `ls` run in the
//! interactive shell) and then transferred one file at a time; a failed
//! file is reported and the batch moves on.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::{SshError, SshSession, POLL};

/// How often a running transfer reports progress
const REPORT_EVERY: Duration = Duration::from_secs(1);

/// One file copy in either direction
pub trait FileTransfer {
    /// Copy remote file `remote` to `local`, returning the byte count
    fn read_one(&mut self, remote: &str, local: &Path) -> Result<u64, SshError>;
    /// Copy `local` to remote path `remote`, returning the byte count
    fn write_one(&mut self, local: &Path, remote: &str) -> Result<u64, SshError>;
}

/// Byte counter that emits a status line at most once a second
pub struct Progress {
    name: String,
    total: Option<u64>,
    bytes: u64,
    started: Instant,
    reported: Instant,
}

impl Progress {
    pub fn new(name: &str, total: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            name: name.to_string(),
            total,
            bytes: 0,
            started: now,
            reported: now,
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn add(&mut self, n: usize, report: &mut dyn FnMut(&str)) {
        self.bytes += n as u64;
        if self.reported.elapsed() >= REPORT_EVERY {
            self.reported = Instant::now();
            report(&format!("\r{}", self.line()));
        }
    }

    pub fn finish(&self, report: &mut dyn FnMut(&str)) {
        report(&format!("\r{}\r\n", self.line()));
    }

    fn line(&self) -> String {
        let secs = self.started.elapsed().as_secs_f64().max(0.001);
        let rate = self.bytes as f64 / secs / 1024.0;
        match self.total {
            Some(total) => format!("{}: {} of {} bytes, {:.1} KB/s", self.name, self.bytes, total, rate),
            None => format!("{}: {} bytes, {:.1} KB/s", self.name, self.bytes, rate),
        }
    }
}

fn local_err(path: &Path) -> impl FnOnce(io::Error) -> SshError + '_ {
    move |source| SshError::Local {
        path: path.to_path_buf(),
        source,
    }
}

impl SshSession {
    /// Download one remote file over scp
    pub fn scp_read_one(
        &self,
        remote: &str,
        local: &Path,
        chunk: usize,
        report: &mut dyn FnMut(&str),
    ) -> Result<u64, SshError> {
        let (mut channel, stat) = self
            .exclusive(|s| s.scp_recv(Path::new(remote)))
            .map_err(|e| SshError::Remote(format!("{}: {}", remote, e)))?;
        let total = stat.size();
        let mut file = File::create(local).map_err(local_err(local))?;
        info!("scp {} -> {} ({} bytes)", remote, local.display(), total);

        let mut progress = Progress::new(remote, Some(total));
        let mut buf = vec![0u8; chunk.max(1024)];
        while progress.bytes() < total {
            let want = ((total - progress.bytes()) as usize).min(buf.len());
            match self.channel_read(&mut channel, &mut buf[..want]) {
                Ok(None) => self.wait_socket(POLL),
                Ok(Some(0)) => break,
                Ok(Some(n)) => {
                    if let Err(e) = file.write_all(&buf[..n]) {
                        self.close_channel(&mut channel);
                        return Err(local_err(local)(e));
                    }
                    progress.add(n, report);
                }
                Err(e) => {
                    self.close_channel(&mut channel);
                    return Err(e);
                }
            }
        }
        self.close_channel(&mut channel);
        progress.finish(report);

        if progress.bytes() < total {
            return Err(SshError::Remote(format!(
                "{}: transfer cut short at {} of {} bytes",
                remote,
                progress.bytes(),
                total
            )));
        }
        Ok(total)
    }

    /// Upload one local file over scp
    pub fn scp_write_one(
        &self,
        local: &Path,
        remote: &str,
        chunk: usize,
        report: &mut dyn FnMut(&str),
    ) -> Result<u64, SshError> {
        let mut file = File::open(local).map_err(local_err(local))?;
        let size = file.metadata().map_err(local_err(local))?.len();
        let mut channel = self
            .exclusive(|s| s.scp_send(Path::new(remote), 0o644, size, None))
            .map_err(|e| SshError::Remote(format!("{}: {}", remote, e)))?;
        info!("scp {} -> {} ({} bytes)", local.display(), remote, size);

        let mut progress = Progress::new(remote, Some(size));
        let mut buf = vec![0u8; chunk.max(1024)];
        let result = loop {
            let n = match file.read(&mut buf) {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(local_err(local)(e)),
            };
            if let Err(e) = self.channel_write_all(&mut channel, &buf[..n]) {
                break Err(e);
            }
            progress.add(n, report);
        };

        let _ = self.exclusive(|_| channel.send_eof());
        let _ = self.exclusive(|_| channel.wait_eof());
        let _ = self.exclusive(|_| channel.close());
        let _ = self.exclusive(|_| channel.wait_close());
        result?;
        progress.finish(report);
        Ok(progress.bytes())
    }
}

/// scp over a live session
pub struct ScpTransfer<'a> {
    ssh: &'a SshSession,
    chunk: usize,
    report: &'a mut dyn FnMut(&str),
}

impl<'a> ScpTransfer<'a> {
    pub fn new(ssh: &'a SshSession, chunk: usize, report: &'a mut dyn FnMut(&str)) -> Self {
        Self { ssh, chunk, report }
    }
}

impl FileTransfer for ScpTransfer<'_> {
    fn read_one(&mut self, remote: &str, local: &Path) -> Result<u64, SshError> {
        self.ssh.scp_read_one(remote, local, self.chunk, self.report)
    }

    fn write_one(&mut self, local: &Path, remote: &str) -> Result<u64, SshError> {
        self.ssh.scp_write_one(local, remote, self.chunk, self.report)
    }
}

pub fn has_wildcard(s: &str) -> bool {
    s.contains(['*', '?'])
}

/// Shell-style match supporting `*` and `?`
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

/// Split a remote path into its directory and final component
pub fn split_remote(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((dir, name)) => (dir, name),
        None => (".", path),
    }
}

pub fn join_remote(dir: &str, name: &str) -> String {
    if dir == "." || dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Names from the screen output of `ls -1`: the first line is the echoed
/// command and the last is the next prompt
pub fn parse_listing(output: &str) -> Vec<&str> {
    let lines: Vec<&str> = output.lines().collect();
    if lines.len() < 2 {
        return Vec::new();
    }
    lines[1..lines.len() - 1]
        .iter()
        .map(|l| l.trim_end_matches('\r').trim())
        .filter(|l| !l.is_empty())
        .collect()
}

/// Remote/local pairs for every listed name matching `pattern`
pub fn plan_download(names: &[&str], remote_dir: &str, pattern: &str, local_dir: &Path) -> Vec<(String, PathBuf)> {
    names
        .iter()
        .filter(|name| wildcard_match(pattern, name))
        .map(|name| (join_remote(remote_dir, name), local_dir.join(name)))
        .collect()
}

/// Local/remote pairs for every regular file in `local_dir` matching `pattern`
pub fn plan_upload(local_dir: &Path, pattern: &str, remote_dir: &str) -> io::Result<Vec<(PathBuf, String)>> {
    let mut plan = Vec::new();
    for entry in fs::read_dir(local_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if wildcard_match(pattern, &name) {
            plan.push((entry.path(), join_remote(remote_dir, &name)));
        }
    }
    plan.sort();
    Ok(plan)
}

/// Run a download plan, reporting failures and continuing. Returns how
/// many files made it.
pub fn run_downloads(xfer: &mut dyn FileTransfer, plan: &[(String, PathBuf)], errors: &mut dyn FnMut(&str)) -> usize {
    let mut done = 0;
    for (remote, local) in plan {
        match xfer.read_one(remote, local) {
            Ok(_) => done += 1,
            Err(e) => {
                warn!("download of {} failed: {}", remote, e);
                errors(&e.to_string());
            }
        }
    }
    done
}

pub fn run_uploads(xfer: &mut dyn FileTransfer, plan: &[(PathBuf, String)], errors: &mut dyn FnMut(&str)) -> usize {
    let mut done = 0;
    for (local, remote) in plan {
        match xfer.write_one(local, remote) {
            Ok(_) => done += 1,
            Err(e) => {
                warn!("upload of {} failed: {}", local.display(), e);
                errors(&e.to_string());
            }
        }
    }
    done
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Recorder {
        reads: Vec<(String, PathBuf)>,
        writes: Vec<(PathBuf, String)>,
        fail: Option<String>,
    }

    impl FileTransfer for Recorder {
        fn read_one(&mut self, remote: &str, local: &Path) -> Result<u64, SshError> {
            self.reads.push((remote.to_string(), local.to_path_buf()));
            if self.fail.as_deref() == Some(remote) {
                return Err(SshError::Remote(format!("{}: permission denied", remote)));
            }
            Ok(10)
        }

        fn write_one(&mut self, local: &Path, remote: &str) -> Result<u64, SshError> {
            self.writes.push((local.to_path_buf(), remote.to_string()));
            Ok(10)
        }
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*.txt", "a.txt"));
        assert!(wildcard_match("*.txt", ".txt"));
        assert!(!wildcard_match("*.txt", "a.txt.bak"));
        assert!(wildcard_match("log?.*", "log1.gz"));
        assert!(!wildcard_match("log?.*", "log10.gz"));
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("a*b*c", "aXXbYYc"));
        assert!(!wildcard_match("a*b*c", "aXXbYY"));
    }

    #[test]
    fn test_split_and_join_remote() {
        assert_eq!(split_remote("/data/*.txt"), ("/data", "*.txt"));
        assert_eq!(split_remote("/*.txt"), ("/", "*.txt"));
        assert_eq!(split_remote("*.txt"), (".", "*.txt"));
        assert_eq!(join_remote("/", "a"), "/a");
        assert_eq!(join_remote(".", "a"), "a");
        assert_eq!(join_remote("/data", "a"), "/data/a");
    }

    #[test]
    fn test_parse_listing_drops_echo_and_prompt() {
        let out = "ls -1 /data\na.txt\nb.txt\nnotes.md\nc.txt\nuser@box:~$ ";
        assert_eq!(parse_listing(out), vec!["a.txt", "b.txt", "notes.md", "c.txt"]);
        assert!(parse_listing("user@box:~$ ").is_empty());
    }

    #[test]
    fn test_glob_download_transfers_matching_files() {
        let out = "ls -1 /data\na.txt\nb.txt\nnotes.md\nc.txt\nuser@box:~$ ";
        let names = parse_listing(out);
        let plan = plan_download(&names, "/data", "*.txt", Path::new("/tmp/in"));

        let mut rec = Recorder::default();
        let done = run_downloads(&mut rec, &plan, &mut |_| {});
        assert_eq!(done, 3);
        assert_eq!(
            rec.reads,
            vec![
                ("/data/a.txt".to_string(), PathBuf::from("/tmp/in/a.txt")),
                ("/data/b.txt".to_string(), PathBuf::from("/tmp/in/b.txt")),
                ("/data/c.txt".to_string(), PathBuf::from("/tmp/in/c.txt")),
            ]
        );
    }

    #[test]
    fn test_failed_file_does_not_stop_batch() {
        let plan = plan_download(&["a.txt", "b.txt", "c.txt"], "/d", "*.txt", Path::new("out"));
        let mut rec = Recorder {
            fail: Some("/d/b.txt".to_string()),
            ..Default::default()
        };
        let mut errors = Vec::new();
        let done = run_downloads(&mut rec, &plan, &mut |e| errors.push(e.to_string()));
        assert_eq!(done, 2);
        assert_eq!(rec.reads.len(), 3);
        assert_eq!(errors, vec!["/d/b.txt: permission denied".to_string()]);
    }

    #[test]
    fn test_plan_upload_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["one.log", "two.log", "skip.txt"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(dir.path().join("sub.log")).unwrap();

        let plan = plan_upload(dir.path(), "*.log", "/var/tmp").unwrap();
        let remotes: Vec<_> = plan.iter().map(|(_, r)| r.as_str()).collect();
        assert_eq!(remotes, vec!["/var/tmp/one.log", "/var/tmp/two.log"]);

        let mut rec = Recorder::default();
        assert_eq!(run_uploads(&mut rec, &plan, &mut |_| {}), 2);
        assert_eq!(rec.writes[0].0, dir.path().join("one.log"));
    }

    #[test]
    fn test_progress_final_line() {
        let mut lines = Vec::new();
        let mut progress = Progress::new("a.bin", Some(100));
        progress.add(100, &mut |l| lines.push(l.to_string()));
        progress.finish(&mut |l| lines.push(l.to_string()));
        let last = lines.last().unwrap();
        assert!(last.starts_with("\ra.bin: 100 of 100 bytes"));
        assert!(last.ends_with("\r\n"));
    }
}
