//! Line-oriented SFTP client
//!
//! [`sftp_cmd`] interprets one command line against a [`RemoteFs`] and
//! writes its output as terminal text. The remote working directory is
//! kept client side, so every path is made absolute before use.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use ssh2::{FileStat, Sftp};
use tracing::{debug, info};

use super::scp::{has_wildcard, join_remote, split_remote, wildcard_match, Progress};
use super::{SshError, SshSession};

const USAGE: &str = "commands: cd [dir], ls [path], get remote [local], put local [remote], \
rm path, mkdir dir, rmdir dir, ren from to, pwd, lpwd, lcd dir, lls, bye\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

/// Remote file operations used by the command loop
pub trait RemoteFs {
    fn realpath(&mut self, path: &str) -> Result<String, SshError>;
    fn is_dir(&mut self, path: &str) -> bool;
    fn list(&mut self, dir: &str) -> Result<Vec<RemoteEntry>, SshError>;
    fn get(&mut self, remote: &str, local: &Path) -> Result<u64, SshError>;
    fn put(&mut self, local: &Path, remote: &str) -> Result<u64, SshError>;
    fn remove(&mut self, path: &str) -> Result<(), SshError>;
    fn mkdir(&mut self, path: &str) -> Result<(), SshError>;
    fn rmdir(&mut self, path: &str) -> Result<(), SshError>;
    fn rename(&mut self, from: &str, to: &str) -> Result<(), SshError>;
}

#[derive(Debug, Clone)]
pub struct SftpState {
    pub remote_cwd: String,
    pub local_cwd: PathBuf,
}

impl SftpState {
    pub fn new(remote_cwd: String, local_cwd: PathBuf) -> Self {
        Self {
            remote_cwd,
            local_cwd,
        }
    }

    /// Absolute remote path for `path`
    pub fn remote(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else if path == "." || path.is_empty() {
            self.remote_cwd.clone()
        } else {
            join_remote(&self.remote_cwd, path)
        }
    }

    pub fn local(&self, path: &str) -> PathBuf {
        self.local_cwd.join(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SftpFlow {
    Continue,
    Bye,
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Run one command line, appending its output to `out`
pub fn sftp_cmd(fs: &mut dyn RemoteFs, state: &mut SftpState, line: &str, out: &mut String) -> SftpFlow {
    let args: Vec<&str> = line.split_whitespace().collect();
    let Some((&cmd, args)) = args.split_first() else {
        return SftpFlow::Continue;
    };
    debug!("sftp> {}", line.trim());

    let result = match (cmd, args) {
        ("bye" | "quit" | "exit", _) => return SftpFlow::Bye,
        ("cd", []) => cd(fs, state, "/"),
        ("cd", [dir]) => cd(fs, state, dir),
        ("pwd", []) => {
            out.push_str(&format!("Remote working directory: {}\r\n", state.remote_cwd));
            Ok(())
        }
        ("lpwd", []) => {
            out.push_str(&format!("Local working directory: {}\r\n", state.local_cwd.display()));
            Ok(())
        }
        ("lls", []) => {
            for name in local_names(&state.local_cwd) {
                out.push_str(&name);
                out.push_str("\r\n");
            }
            Ok(())
        }
        ("lcd", [dir]) => {
            let path = state.local(dir);
            if path.is_dir() {
                state.local_cwd = path;
                Ok(())
            } else {
                Err(format!("{}: not a directory", path.display()))
            }
        }
        ("ls" | "dir", []) => ls(fs, state, ".", out),
        ("ls" | "dir", [path]) => ls(fs, state, path, out),
        ("get", [remote]) => get(fs, state, remote, None, out),
        ("get", [remote, local]) => get(fs, state, remote, Some(*local), out),
        ("put", [local]) => put(fs, state, local, None, out),
        ("put", [local, remote]) => put(fs, state, local, Some(*remote), out),
        ("rm" | "del", [path]) => fs.remove(&state.remote(path)).map_err(|e| e.to_string()),
        ("mkdir", [path]) => fs.mkdir(&state.remote(path)).map_err(|e| e.to_string()),
        ("rmdir", [path]) => fs.rmdir(&state.remote(path)).map_err(|e| e.to_string()),
        ("ren" | "rename", [from, to]) => fs
            .rename(&state.remote(from), &state.remote(to))
            .map_err(|e| e.to_string()),
        _ => {
            out.push_str(USAGE);
            Ok(())
        }
    };
    if let Err(e) = result {
        out.push_str(&e);
        out.push_str("\r\n");
    }
    SftpFlow::Continue
}

fn cd(fs: &mut dyn RemoteFs, state: &mut SftpState, dir: &str) -> Result<(), String> {
    let target = state.remote(dir);
    let resolved = fs.realpath(&target).map_err(|e| e.to_string())?;
    if !fs.is_dir(&resolved) {
        return Err(format!("{}: not a directory", resolved));
    }
    state.remote_cwd = resolved;
    Ok(())
}

/// Entries of `path`, or of its directory filtered by a wildcard
fn matching(fs: &mut dyn RemoteFs, state: &SftpState, path: &str) -> Result<(String, Vec<RemoteEntry>), String> {
    let full = state.remote(path);
    if has_wildcard(path) {
        let (dir, pattern) = split_remote(&full);
        let mut entries = fs.list(dir).map_err(|e| e.to_string())?;
        entries.retain(|e| wildcard_match(pattern, &e.name));
        Ok((dir.to_string(), entries))
    } else {
        let entries = fs.list(&full).map_err(|e| e.to_string())?;
        Ok((full, entries))
    }
}

fn ls(fs: &mut dyn RemoteFs, state: &SftpState, path: &str, out: &mut String) -> Result<(), String> {
    let (_, mut entries) = matching(fs, state, path)?;
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    for e in entries {
        let kind = if e.is_dir { 'd' } else { '-' };
        out.push_str(&format!("{} {:>12}  {}\r\n", kind, e.size, e.name));
    }
    Ok(())
}

fn get(
    fs: &mut dyn RemoteFs,
    state: &SftpState,
    remote: &str,
    local: Option<&str>,
    out: &mut String,
) -> Result<(), String> {
    if !has_wildcard(remote) {
        let source = state.remote(remote);
        let target = match local {
            Some(l) => state.local(l),
            None => state.local(file_name(&source)),
        };
        let n = fs.get(&source, &target).map_err(|e| e.to_string())?;
        out.push_str(&format!("{} -> {} ({} bytes)\r\n", source, target.display(), n));
        return Ok(());
    }

    let (dir, entries) = matching(fs, state, remote)?;
    let target_dir = local.map_or_else(|| state.local_cwd.clone(), |l| state.local(l));
    let mut done = 0;
    for e in entries.iter().filter(|e| !e.is_dir) {
        let source = join_remote(&dir, &e.name);
        match fs.get(&source, &target_dir.join(&e.name)) {
            Ok(_) => done += 1,
            Err(err) => out.push_str(&format!("{}\r\n", err)),
        }
    }
    out.push_str(&format!("{} file(s) downloaded\r\n", done));
    Ok(())
}

fn put(
    fs: &mut dyn RemoteFs,
    state: &SftpState,
    local: &str,
    remote: Option<&str>,
    out: &mut String,
) -> Result<(), String> {
    if !has_wildcard(local) {
        let source = state.local(local);
        let target = match remote {
            Some(r) => state.remote(r),
            None => state.remote(&source.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()),
        };
        let n = fs.put(&source, &target).map_err(|e| e.to_string())?;
        out.push_str(&format!("{} -> {} ({} bytes)\r\n", source.display(), target, n));
        return Ok(());
    }

    let pattern_path = state.local(local);
    let dir = pattern_path.parent().map_or_else(|| state.local_cwd.clone(), Path::to_path_buf);
    let pattern = pattern_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let target_dir = remote.map_or_else(|| state.remote_cwd.clone(), |r| state.remote(r));
    let plan = super::scp::plan_upload(&dir, &pattern, &target_dir)
        .map_err(|e| format!("{}: {}", dir.display(), e))?;
    let mut done = 0;
    for (source, target) in &plan {
        match fs.put(source, target) {
            Ok(_) => done += 1,
            Err(err) => out.push_str(&format!("{}\r\n", err)),
        }
    }
    out.push_str(&format!("{} file(s) uploaded\r\n", done));
    Ok(())
}

/// [`RemoteFs`] over an ssh2 SFTP channel
pub struct SftpFs<'a> {
    ssh: &'a SshSession,
    sftp: Sftp,
    chunk: usize,
    report: Box<dyn FnMut(&str) + 'a>,
}

impl<'a> SftpFs<'a> {
    pub fn open(ssh: &'a SshSession, chunk: usize) -> Result<Self, SshError> {
        let sftp = ssh.exclusive(|s| s.sftp()).map_err(|e| match e {
            SshError::Lib { source, .. } => SshError::Lib {
                context: "sftp subsystem",
                source,
            },
            other => other,
        })?;
        Ok(Self {
            ssh,
            sftp,
            chunk: chunk.max(1024),
            report: Box::new(|_| {}),
        })
    }

    /// Send transfer progress lines to `report`
    pub fn with_progress(mut self, report: impl FnMut(&str) + 'a) -> Self {
        self.report = Box::new(report);
        self
    }

    fn stat(&self, path: &str) -> Result<FileStat, SshError> {
        self.ssh
            .exclusive(|_| self.sftp.stat(Path::new(path)))
            .map_err(|e| remote_err(path, e))
    }
}

fn remote_err(path: &str, e: SshError) -> SshError {
    match e {
        SshError::Lib { source, .. } => SshError::Remote(format!("{}: {}", path, source.message())),
        other => other,
    }
}

impl RemoteFs for SftpFs<'_> {
    fn realpath(&mut self, path: &str) -> Result<String, SshError> {
        let resolved = self
            .ssh
            .exclusive(|_| self.sftp.realpath(Path::new(path)))
            .map_err(|e| remote_err(path, e))?;
        Ok(resolved.to_string_lossy().into_owned())
    }

    fn is_dir(&mut self, path: &str) -> bool {
        self.stat(path).map_or(false, |st| st.is_dir())
    }

    fn list(&mut self, dir: &str) -> Result<Vec<RemoteEntry>, SshError> {
        let entries = self
            .ssh
            .exclusive(|_| self.sftp.readdir(Path::new(dir)))
            .map_err(|e| remote_err(dir, e))?;
        Ok(entries
            .into_iter()
            .map(|(path, st)| RemoteEntry {
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                size: st.size.unwrap_or(0),
                is_dir: st.is_dir(),
            })
            .filter(|e| e.name != "." && e.name != "..")
            .collect())
    }

    fn get(&mut self, remote: &str, local: &Path) -> Result<u64, SshError> {
        let total = self.stat(remote)?.size;
        let mut src = self
            .ssh
            .exclusive(|_| self.sftp.open(Path::new(remote)))
            .map_err(|e| remote_err(remote, e))?;
        let mut dst = File::create(local).map_err(|source| SshError::Local {
            path: local.to_path_buf(),
            source,
        })?;
        info!("sftp get {} -> {}", remote, local.display());

        let mut progress = Progress::new(file_name(remote), total);
        let mut buf = vec![0u8; self.chunk];
        loop {
            let n = self.ssh.exclusive(|_| src.read(&mut buf))?;
            if n == 0 {
                break;
            }
            dst.write_all(&buf[..n]).map_err(|source| SshError::Local {
                path: local.to_path_buf(),
                source,
            })?;
            progress.add(n, &mut *self.report);
        }
        progress.finish(&mut *self.report);
        Ok(progress.bytes())
    }

    fn put(&mut self, local: &Path, remote: &str) -> Result<u64, SshError> {
        let local_err = |source| SshError::Local {
            path: local.to_path_buf(),
            source,
        };
        let mut src = File::open(local).map_err(local_err)?;
        let total = src.metadata().map_err(local_err)?.len();
        let mut dst = self
            .ssh
            .exclusive(|_| self.sftp.create(Path::new(remote)))
            .map_err(|e| remote_err(remote, e))?;
        info!("sftp put {} -> {}", local.display(), remote);

        let mut progress = Progress::new(file_name(remote), Some(total));
        let mut buf = vec![0u8; self.chunk];
        loop {
            let n = src.read(&mut buf).map_err(local_err)?;
            if n == 0 {
                break;
            }
            let mut written = 0;
            while written < n {
                let w = self.ssh.exclusive(|_| dst.write(&buf[written..n]))?;
                written += w;
            }
            progress.add(n, &mut *self.report);
        }
        progress.finish(&mut *self.report);
        Ok(progress.bytes())
    }

    fn remove(&mut self, path: &str) -> Result<(), SshError> {
        self.ssh
            .exclusive(|_| self.sftp.unlink(Path::new(path)))
            .map_err(|e| remote_err(path, e))
    }

    fn mkdir(&mut self, path: &str) -> Result<(), SshError> {
        self.ssh
            .exclusive(|_| self.sftp.mkdir(Path::new(path), 0o755))
            .map_err(|e| remote_err(path, e))
    }

    fn rmdir(&mut self, path: &str) -> Result<(), SshError> {
        self.ssh
            .exclusive(|_| self.sftp.rmdir(Path::new(path)))
            .map_err(|e| remote_err(path, e))
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), SshError> {
        self.ssh
            .exclusive(|_| self.sftp.rename(Path::new(from), Path::new(to), None))
            .map_err(|e| remote_err(from, e))
    }
}

/// Sorted names in a local directory
pub fn local_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|rd| {
            rd.filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    /// In-memory remote tree: path -> Some(content) for files, None for dirs
    struct MemFs {
        nodes: BTreeMap<String, Option<Vec<u8>>>,
    }

    impl MemFs {
        fn new() -> Self {
            let mut nodes = BTreeMap::new();
            for dir in ["/", "/home", "/home/u", "/home/u/logs"] {
                nodes.insert(dir.to_string(), None);
            }
            for (file, body) in [
                ("/home/u/a.txt", "alpha"),
                ("/home/u/b.txt", "bravo"),
                ("/home/u/notes.md", "notes"),
                ("/home/u/logs/x.log", "x"),
            ] {
                nodes.insert(file.to_string(), Some(body.as_bytes().to_vec()));
            }
            Self { nodes }
        }

        fn missing(path: &str) -> SshError {
            SshError::Remote(format!("{}: no such file", path))
        }
    }

    impl RemoteFs for MemFs {
        fn realpath(&mut self, path: &str) -> Result<String, SshError> {
            let mut parts: Vec<&str> = Vec::new();
            for part in path.split('/') {
                match part {
                    "" | "." => {}
                    ".." => {
                        parts.pop();
                    }
                    p => parts.push(p),
                }
            }
            let resolved = format!("/{}", parts.join("/"));
            if self.nodes.contains_key(&resolved) {
                Ok(resolved)
            } else {
                Err(Self::missing(path))
            }
        }

        fn is_dir(&mut self, path: &str) -> bool {
            matches!(self.nodes.get(path), Some(None))
        }

        fn list(&mut self, dir: &str) -> Result<Vec<RemoteEntry>, SshError> {
            if !self.is_dir(dir) {
                return Err(Self::missing(dir));
            }
            let prefix = if dir == "/" { "/".to_string() } else { format!("{}/", dir) };
            Ok(self
                .nodes
                .iter()
                .filter_map(|(path, node)| {
                    let rest = path.strip_prefix(&prefix)?;
                    if rest.is_empty() || rest.contains('/') {
                        return None;
                    }
                    Some(RemoteEntry {
                        name: rest.to_string(),
                        size: node.as_ref().map_or(0, |b| b.len() as u64),
                        is_dir: node.is_none(),
                    })
                })
                .collect())
        }

        fn get(&mut self, remote: &str, local: &Path) -> Result<u64, SshError> {
            let body = match self.nodes.get(remote) {
                Some(Some(body)) => body.clone(),
                _ => return Err(Self::missing(remote)),
            };
            fs::write(local, &body)?;
            Ok(body.len() as u64)
        }

        fn put(&mut self, local: &Path, remote: &str) -> Result<u64, SshError> {
            let body = fs::read(local)?;
            let n = body.len() as u64;
            self.nodes.insert(remote.to_string(), Some(body));
            Ok(n)
        }

        fn remove(&mut self, path: &str) -> Result<(), SshError> {
            match self.nodes.get(path) {
                Some(Some(_)) => {
                    self.nodes.remove(path);
                    Ok(())
                }
                _ => Err(Self::missing(path)),
            }
        }

        fn mkdir(&mut self, path: &str) -> Result<(), SshError> {
            self.nodes.insert(path.to_string(), None);
            Ok(())
        }

        fn rmdir(&mut self, path: &str) -> Result<(), SshError> {
            if !self.is_dir(path) {
                return Err(Self::missing(path));
            }
            self.nodes.remove(path);
            Ok(())
        }

        fn rename(&mut self, from: &str, to: &str) -> Result<(), SshError> {
            let node = self.nodes.remove(from).ok_or_else(|| Self::missing(from))?;
            self.nodes.insert(to.to_string(), node);
            Ok(())
        }
    }

    fn run(fs: &mut MemFs, state: &mut SftpState, line: &str) -> (SftpFlow, String) {
        let mut out = String::new();
        let flow = sftp_cmd(fs, state, line, &mut out);
        (flow, out)
    }

    fn setup() -> (MemFs, SftpState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let state = SftpState::new("/home/u".to_string(), dir.path().to_path_buf());
        (MemFs::new(), state, dir)
    }

    #[test]
    fn test_cd_and_pwd() {
        let (mut fs, mut state, _dir) = setup();
        run(&mut fs, &mut state, "cd logs");
        assert_eq!(state.remote_cwd, "/home/u/logs");
        run(&mut fs, &mut state, "cd ..");
        assert_eq!(state.remote_cwd, "/home/u");

        let (_, out) = run(&mut fs, &mut state, "cd a.txt");
        assert_eq!(out, "/home/u/a.txt: not a directory\r\n");
        assert_eq!(state.remote_cwd, "/home/u");

        let (_, out) = run(&mut fs, &mut state, "pwd");
        assert_eq!(out, "Remote working directory: /home/u\r\n");
    }

    #[test]
    fn test_ls_with_pattern() {
        let (mut fs, mut state, _dir) = setup();
        let (_, out) = run(&mut fs, &mut state, "ls *.txt");
        assert_eq!(
            out,
            "-            5  a.txt\r\n-            5  b.txt\r\n"
        );
        let (_, out) = run(&mut fs, &mut state, "ls");
        assert!(out.contains("d            0  logs\r\n"));
    }

    #[test]
    fn test_get_single_and_wildcard() {
        let (mut fs, mut state, dir) = setup();
        let (_, out) = run(&mut fs, &mut state, "get a.txt");
        assert!(out.starts_with("/home/u/a.txt -> "));
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"alpha");

        let (_, out) = run(&mut fs, &mut state, "get *.txt");
        assert!(out.ends_with("2 file(s) downloaded\r\n"));
        assert_eq!(local_names(dir.path()), vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn test_put_rename_remove() {
        let (mut fs, mut state, dir) = setup();
        fs::write(dir.path().join("up.bin"), b"12345678").unwrap();
        let (_, out) = run(&mut fs, &mut state, "put up.bin");
        assert!(out.ends_with("(8 bytes)\r\n"));
        assert!(fs.nodes.contains_key("/home/u/up.bin"));

        run(&mut fs, &mut state, "ren up.bin logs/up.bin");
        assert!(fs.nodes.contains_key("/home/u/logs/up.bin"));
        run(&mut fs, &mut state, "rm logs/up.bin");
        assert!(!fs.nodes.contains_key("/home/u/logs/up.bin"));

        let (_, out) = run(&mut fs, &mut state, "rm nothing");
        assert_eq!(out, "/home/u/nothing: no such file\r\n");
    }

    #[test]
    fn test_mkdir_rmdir() {
        let (mut fs, mut state, _dir) = setup();
        run(&mut fs, &mut state, "mkdir /tmp");
        assert!(fs.is_dir("/tmp"));
        run(&mut fs, &mut state, "rmdir /tmp");
        assert!(!fs.nodes.contains_key("/tmp"));
    }

    #[test]
    fn test_local_directory_commands() {
        let (mut fs, mut state, dir) = setup();
        fs::create_dir(dir.path().join("sub")).unwrap();
        run(&mut fs, &mut state, "lcd sub");
        assert_eq!(state.local_cwd, dir.path().join("sub"));
        let (_, out) = run(&mut fs, &mut state, "lpwd");
        assert!(out.contains("sub"));
        fs::write(dir.path().join("sub/local.txt"), b"l").unwrap();
        let (_, out) = run(&mut fs, &mut state, "lls");
        assert_eq!(out, "local.txt\r\n");
        let (_, out) = run(&mut fs, &mut state, "lcd missing");
        assert!(out.ends_with("not a directory\r\n"));
    }

    #[test]
    fn test_unknown_command_and_bye() {
        let (mut fs, mut state, _dir) = setup();
        let (flow, out) = run(&mut fs, &mut state, "chmod 777 a.txt");
        assert_eq!(flow, SftpFlow::Continue);
        assert_eq!(out, USAGE);
        let (flow, out) = run(&mut fs, &mut state, "");
        assert_eq!(flow, SftpFlow::Continue);
        assert!(out.is_empty());
        assert_eq!(run(&mut fs, &mut state, "bye").0, SftpFlow::Bye);
    }
}
