//! Host key verification and user authentication
//!
//! Unknown or changed host keys are shown to the user as a SHA-256
//! fingerprint and only stored after an explicit "yes". Authentication
//! tries public keys first, then password, then keyboard-interactive.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use ssh2::{CheckResult, ErrorCode, HashType, KeyboardInteractivePrompt, KnownHostFileKind, Prompt, Session};
use tracing::{debug, info, warn};

use super::{SshError, SshSession};
use crate::core::script::PromptProvider;

/// libssh2's LIBSSH2_ERROR_AUTHENTICATION_FAILED
const AUTHENTICATION_FAILED: i32 = -18;

/// Options collected from the connection string and config
#[derive(Debug, Clone, Default)]
pub struct AuthOptions {
    pub password: Option<String>,
    pub passphrase: Option<String>,
    pub identities: Vec<PathBuf>,
    pub attempts: u32,
}

/// Outcome of looking a key up in known_hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyStatus {
    Known,
    Unknown,
    Changed,
}

/// Name known_hosts uses for a host on a non-default port
pub fn known_hosts_name(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

pub fn fingerprint(hash: &[u8]) -> String {
    let mut out = String::with_capacity(hash.len() * 3);
    for (i, b) in hash.iter().enumerate() {
        if i > 0 {
            out.push(':');
        }
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Question shown before trusting a key
pub fn host_key_question(host: &str, status: HostKeyStatus, fingerprint: &str) -> String {
    let headline = match status {
        HostKeyStatus::Changed => format!(
            "WARNING: the host key for {} has CHANGED. Someone may be intercepting the connection.",
            host
        ),
        _ => format!("The authenticity of host {} can't be established.", host),
    };
    format!(
        "\r\n{}\r\nSHA256 fingerprint: {}\r\nTrust this key and continue (yes/no)? ",
        headline, fingerprint
    )
}

pub fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "yes" | "y")
}

impl SshSession {
    /// Check the server key against `store`, asking the user when it is
    /// missing or different, and save it once accepted
    pub fn verify_host_key(&self, store: &Path, prompts: &dyn PromptProvider) -> Result<(), SshError> {
        let name = known_hosts_name(self.host(), self.port());
        let (status, fp, key, key_type) = self.locked(|s| -> Result<_, SshError> {
            let (key, key_type) = s.host_key().ok_or(SshError::NoHostKey)?;
            let fp = fingerprint(s.host_key_hash(HashType::Sha256).unwrap_or_default());
            let mut known = s.known_hosts()?;
            if store.exists() {
                if let Err(e) = known.read_file(store, KnownHostFileKind::OpenSSH) {
                    warn!("cannot read {}: {}", store.display(), e);
                }
            }
            let status = match known.check_port(self.host(), self.port(), key) {
                CheckResult::Match => HostKeyStatus::Known,
                CheckResult::Mismatch => HostKeyStatus::Changed,
                CheckResult::NotFound | CheckResult::Failure => HostKeyStatus::Unknown,
            };
            Ok((status, fp, key.to_vec(), key_type))
        })?;

        if status == HostKeyStatus::Known {
            debug!("host key for {} matches known_hosts", name);
            return Ok(());
        }
        let answer = prompts.ask(&host_key_question(&name, status, &fp), true);
        if !answer.as_deref().map_or(false, is_yes) {
            return Err(SshError::HostKeyRejected(name));
        }

        self.locked(|s| -> Result<(), SshError> {
            let mut known = s.known_hosts()?;
            if store.exists() {
                known.read_file(store, KnownHostFileKind::OpenSSH)?;
            }
            if status == HostKeyStatus::Changed {
                let stale: Vec<_> = known
                    .iter()?
                    .into_iter()
                    .filter(|h| h.name() == Some(name.as_str()))
                    .collect();
                for host in &stale {
                    known.remove(host)?;
                }
            }
            known.add(&name, &key, "added by tterm", key_type.into())?;
            if let Some(dir) = store.parent() {
                fs::create_dir_all(dir).map_err(|source| SshError::Local {
                    path: dir.to_path_buf(),
                    source,
                })?;
            }
            known.write_file(store, KnownHostFileKind::OpenSSH)?;
            Ok(())
        })?;
        info!("stored host key for {} in {}", name, store.display());
        Ok(())
    }

    /// Authenticate as `user`, trying each method the server allows.
    ///
    /// Runs while the session is still blocking and owned by the connecting
    /// thread; no channel exists yet, so waiting on the user with the
    /// session locked stalls nobody else.
    pub fn authenticate(
        &self,
        user: &str,
        opts: &AuthOptions,
        prompts: &dyn PromptProvider,
    ) -> Result<(), SshError> {
        let methods = self
            .exclusive(|s| s.auth_methods(user).map(str::to_string))
            .unwrap_or_else(|_| "publickey,password,keyboard-interactive".to_string());
        debug!("server offers {}", methods);

        if methods.contains("publickey") && self.try_keys(user, opts) {
            return Ok(());
        }
        if methods.contains("password") && self.try_password(user, opts, prompts) {
            return Ok(());
        }
        if methods.contains("keyboard-interactive") {
            let mut adapter = InteractivePrompts::new(prompts);
            for _ in 0..opts.attempts.max(1) {
                let result = self.locked(|s| s.userauth_keyboard_interactive(user, &mut adapter));
                let authenticated = self.locked(Session::authenticated);
                match interactive_outcome(result, authenticated, adapter.cancelled) {
                    Round::Authenticated => {
                        info!("{} authenticated by keyboard-interactive", user);
                        return Ok(());
                    }
                    Round::Retry => warn!("keyboard-interactive rejected for {}", user),
                    Round::Stop => break,
                }
            }
        }
        Err(SshError::AuthFailed(format!("{}@{}", user, self.host())))
    }

    fn try_keys(&self, user: &str, opts: &AuthOptions) -> bool {
        for private in &opts.identities {
            let public = public_key_path(private);
            if !private.exists() || !public.exists() {
                continue;
            }
            let passphrase = opts.passphrase.as_deref();
            match self.exclusive(|s| s.userauth_pubkey_file(user, Some(public.as_path()), private, passphrase)) {
                Ok(()) if self.locked(Session::authenticated) => {
                    info!("{} authenticated with {}", user, private.display());
                    return true;
                }
                Ok(()) => {}
                Err(e) => debug!("key {} refused: {}", private.display(), e),
            }
        }
        false
    }

    fn try_password(&self, user: &str, opts: &AuthOptions, prompts: &dyn PromptProvider) -> bool {
        let mut given = opts.password.clone();
        for _ in 0..opts.attempts.max(1) {
            let password = match given.take() {
                Some(p) => p,
                None => match prompts.ask(&format!("{}@{}'s password: ", user, self.host()), false) {
                    Some(p) => p,
                    None => return false,
                },
            };
            match self.exclusive(|s| s.userauth_password(user, &password)) {
                Ok(()) if self.locked(Session::authenticated) => {
                    info!("{} authenticated by password", user);
                    return true;
                }
                _ => warn!("password rejected for {}", user),
            }
        }
        false
    }
}

fn public_key_path(private: &Path) -> PathBuf {
    let mut name = private.as_os_str().to_owned();
    name.push(".pub");
    PathBuf::from(name)
}

/// Result of one keyboard-interactive exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Round {
    Authenticated,
    Retry,
    Stop,
}

fn interactive_outcome(result: Result<(), ssh2::Error>, authenticated: bool, cancelled: bool) -> Round {
    if authenticated {
        return Round::Authenticated;
    }
    if cancelled {
        debug!("keyboard-interactive cancelled by the user");
        return Round::Stop;
    }
    match result {
        Ok(()) => Round::Retry,
        Err(e) if e.code() == ErrorCode::Session(AUTHENTICATION_FAILED) => Round::Retry,
        Err(e) => {
            warn!("keyboard-interactive failed: {}", e);
            Round::Stop
        }
    }
}

/// Routes keyboard-interactive questions to the terminal
struct InteractivePrompts<'a> {
    prompts: &'a dyn PromptProvider,
    /// The user abandoned a question; later rounds are not asked
    cancelled: bool,
}

impl<'a> InteractivePrompts<'a> {
    fn new(prompts: &'a dyn PromptProvider) -> Self {
        Self {
            prompts,
            cancelled: false,
        }
    }
}

impl KeyboardInteractivePrompt for InteractivePrompts<'_> {
    fn prompt<'b>(&mut self, _username: &str, instructions: &str, prompts: &[Prompt<'b>]) -> Vec<String> {
        if !instructions.is_empty() {
            debug!("keyboard-interactive: {}", instructions);
        }
        let mut answers = Vec::with_capacity(prompts.len());
        for p in prompts {
            let answer = if self.cancelled {
                None
            } else {
                self.prompts.ask(&p.text, p.echo)
            };
            match answer {
                Some(a) => answers.push(a),
                None => {
                    self.cancelled = true;
                    answers.push(String::new());
                }
            }
        }
        answers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_known_hosts_name() {
        assert_eq!(known_hosts_name("router", 22), "router");
        assert_eq!(known_hosts_name("router", 2222), "[router]:2222");
    }

    #[test]
    fn test_fingerprint_format() {
        assert_eq!(fingerprint(&[0x0a, 0xff, 0x00]), "0a:ff:00");
        assert_eq!(fingerprint(&[]), "");
    }

    #[test]
    fn test_question_mentions_change() {
        let q = host_key_question("r1", HostKeyStatus::Changed, "aa:bb");
        assert!(q.contains("CHANGED"));
        assert!(q.contains("aa:bb"));
        assert!(q.ends_with("(yes/no)? "));
    }

    /// Answers from a fixed list, then gives up
    struct Scripted {
        answers: parking_lot::Mutex<Vec<&'static str>>,
        asked: std::sync::atomic::AtomicUsize,
    }

    impl Scripted {
        fn new(answers: &[&'static str]) -> Self {
            Self {
                answers: parking_lot::Mutex::new(answers.iter().rev().copied().collect()),
                asked: std::sync::atomic::AtomicUsize::new(0),
            }
        }
    }

    impl PromptProvider for Scripted {
        fn ask(&self, _prompt: &str, _echo: bool) -> Option<String> {
            self.asked.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.answers.lock().pop().map(str::to_string)
        }
    }

    fn questions() -> Vec<Prompt<'static>> {
        vec![
            Prompt {
                text: "Password: ".into(),
                echo: false,
            },
            Prompt {
                text: "Token: ".into(),
                echo: true,
            },
        ]
    }

    #[test]
    fn test_interactive_prompts_answer_in_order() {
        let provider = Scripted::new(&["secret", "123456"]);
        let mut adapter = InteractivePrompts::new(&provider);
        let answers = adapter.prompt("admin", "", &questions());
        assert_eq!(answers, vec!["secret".to_string(), "123456".to_string()]);
        assert!(!adapter.cancelled);
    }

    #[test]
    fn test_cancelled_prompt_stops_asking() {
        let provider = Scripted::new(&[]);
        let mut adapter = InteractivePrompts::new(&provider);
        let answers = adapter.prompt("admin", "", &questions());
        assert_eq!(answers, vec![String::new(), String::new()]);
        assert!(adapter.cancelled);
        adapter.prompt("admin", "", &questions());
        assert_eq!(provider.asked.load(std::sync::atomic::Ordering::SeqCst), 1);

        let failed = Err(ssh2::Error::new(ErrorCode::Session(AUTHENTICATION_FAILED), "failed"));
        assert_eq!(interactive_outcome(failed, false, true), Round::Stop);
    }

    #[test]
    fn test_interactive_outcome() {
        let failed = || Err(ssh2::Error::new(ErrorCode::Session(AUTHENTICATION_FAILED), "failed"));
        assert_eq!(interactive_outcome(Ok(()), true, false), Round::Authenticated);
        assert_eq!(interactive_outcome(failed(), false, false), Round::Retry);
        let dropped = Err(ssh2::Error::new(ErrorCode::Session(-13), "socket disconnect"));
        assert_eq!(interactive_outcome(dropped, false, false), Round::Stop);
    }

    #[test]
    fn test_is_yes() {
        assert!(is_yes("yes"));
        assert!(is_yes(" Y "));
        assert!(!is_yes("no"));
        assert!(!is_yes(""));
    }

    #[test]
    fn test_public_key_path() {
        assert_eq!(
            public_key_path(Path::new("/home/u/.ssh/id_rsa")),
            PathBuf::from("/home/u/.ssh/id_rsa.pub")
        );
    }
}
