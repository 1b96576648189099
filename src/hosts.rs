//! Hosts file reconciliation
//!
//! chost owns a single marker-delimited block inside the system hosts file:
//!
//! ```text
//! # CHost managed domains
//! 127.0.0.1	alpha.local
//! 127.0.0.1	beta.local
//! # End CHost managed domains
//! ```
//!
//! Everything outside the markers is kept byte for byte. [`HostsBlock`] is the
//! parsed form of the file, [`HostsReconciler`] performs the locked
//! read-modify-write cycle against the file on disk.

use crate::error::{Error, Result};
use crate::registry::{validate_hostname, DomainRegistry};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

pub const START_MARKER: &str = "# CHost managed domains";
pub const END_MARKER: &str = "# End CHost managed domains";

/// Address every managed hostname resolves to
pub const LOOPBACK: &str = "127.0.0.1";

/// Location of the hosts file on this platform
pub fn default_hosts_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
    } else {
        PathBuf::from("/etc/hosts")
    }
}

/// The managed block could not be located or read unambiguously
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedBlock {
    pub line: usize,
    pub reason: String,
}

/// A hosts file split into foreign content and the managed hostname set.
///
/// Foreign content is kept as raw bytes; it does not have to be UTF-8.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostsBlock {
    /// Raw bytes before the start marker
    pub before: Vec<u8>,
    pub managed: BTreeSet<String>,
    /// Raw bytes after the end marker line
    pub after: Vec<u8>,
}

impl HostsBlock {
    pub fn new(before: impl Into<Vec<u8>>, managed: BTreeSet<String>, after: impl Into<Vec<u8>>) -> Self {
        Self {
            before: before.into(),
            managed,
            after: after.into(),
        }
    }

    /// Split hosts file content around the managed block.
    ///
    /// A start marker with no end marker after it, or more than one start
    /// marker, is reported as malformed; nothing is guessed about where the
    /// block was meant to end. So is a line inside the block that maps to
    /// anything but the loopback address, or that is not UTF-8.
    pub fn parse(content: &[u8]) -> std::result::Result<Self, MalformedBlock> {
        // (line number, offset of the marker line, offset just past it)
        let mut start: Option<(usize, usize, usize)> = None;
        let mut end: Option<(usize, usize)> = None;
        let mut managed = BTreeSet::new();
        let mut offset = 0;

        for (idx, line) in content.split_inclusive(|&b| b == b'\n').enumerate() {
            let number = idx + 1;
            let text = trim_line_ending(line);
            let next = offset + line.len();

            if text == START_MARKER.as_bytes() {
                if let Some((first, _, _)) = start {
                    return Err(MalformedBlock {
                        line: number,
                        reason: format!(
                            "start marker repeated on line {} (first on line {})",
                            number, first
                        ),
                    });
                }
                start = Some((number, offset, next));
            } else if start.is_some() && end.is_none() {
                if text == END_MARKER.as_bytes() {
                    end = Some((offset, next));
                } else {
                    managed.extend(parse_block_line(number, text)?);
                }
            }

            offset = next;
        }

        let Some((start_line, start_at, _)) = start else {
            return Ok(Self::new(content, BTreeSet::new(), Vec::new()));
        };
        let Some((_, after_at)) = end else {
            return Err(MalformedBlock {
                line: start_line,
                reason: format!(
                    "start marker on line {} has no matching end marker",
                    start_line
                ),
            });
        };

        Ok(Self::new(&content[..start_at], managed, &content[after_at..]))
    }

    /// Serialize back to hosts file content.
    /// An empty managed set produces no markers at all.
    pub fn render(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.before.len() + self.after.len() + 64 * (self.managed.len() + 2));
        out.extend_from_slice(&self.before);

        if !self.managed.is_empty() {
            if !out.is_empty() && !out.ends_with(b"\n") {
                out.push(b'\n');
            }
            out.extend_from_slice(START_MARKER.as_bytes());
            out.push(b'\n');
            for hostname in &self.managed {
                out.extend_from_slice(LOOPBACK.as_bytes());
                out.push(b'\t');
                out.extend_from_slice(hostname.as_bytes());
                out.push(b'\n');
            }
            out.extend_from_slice(END_MARKER.as_bytes());
            out.push(b'\n');
        }

        out.extend_from_slice(&self.after);
        out
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_block_line(number: usize, line: &[u8]) -> std::result::Result<Vec<String>, MalformedBlock> {
    let text = std::str::from_utf8(line).map_err(|_| MalformedBlock {
        line: number,
        reason: format!("line {} inside the managed block is not valid UTF-8", number),
    })?;

    parse_mapping_line(text).map_err(|address| MalformedBlock {
        line: number,
        reason: format!(
            "line {} inside the managed block maps to {} instead of {}",
            number, address, LOOPBACK
        ),
    })
}

/// Hostnames from one line inside the block; blanks and comments yield none.
/// A line for any address other than the loopback one is returned as `Err`.
fn parse_mapping_line(line: &str) -> std::result::Result<Vec<String>, String> {
    let line = line.split('#').next().unwrap_or("");
    let mut fields = line.split_whitespace();

    match fields.next() {
        Some(address) if address == LOOPBACK => Ok(fields.map(|h| h.to_ascii_lowercase()).collect()),
        Some(address) => Err(address.to_string()),
        None => Ok(Vec::new()),
    }
}

/// Hosts reconciler configuration
#[derive(Debug, Clone)]
pub struct HostsConfig {
    pub path: PathBuf,
    /// Single-slot snapshot taken before every write
    pub backup_path: PathBuf,
    /// Flush the OS resolver cache after writing
    pub flush_dns: bool,
}

impl HostsConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut backup = path.clone().into_os_string();
        backup.push(".chost-backup");

        Self {
            path,
            backup_path: PathBuf::from(backup),
            flush_dns: true,
        }
    }
}

impl Default for HostsConfig {
    fn default() -> Self {
        Self::new(default_hosts_path())
    }
}

/// Serializes every hosts file write in this process
static HOSTS_WRITE_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Keeps the managed block in sync with a hostname set.
///
/// All mutating operations, across every reconciler in the process, take the
/// same lock, so concurrent callers never lose each other's changes.
pub struct HostsReconciler {
    config: HostsConfig,
}

impl HostsReconciler {
    pub fn new(config: HostsConfig) -> Self {
        Self { config }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Hostnames currently inside the managed block
    pub fn managed_hostnames(&self) -> Result<BTreeSet<String>> {
        let content = self.read()?;
        Ok(self.parse(&content)?.managed)
    }

    /// Add one hostname to the block. Returns whether the file was written.
    pub fn add_hostname(&self, hostname: &str) -> Result<bool> {
        let hostname = validate_hostname(hostname)?;
        self.update(move |managed| {
            managed.insert(hostname);
        })
    }

    /// Remove one hostname from the block. Returns whether the file was written.
    pub fn remove_hostname(&self, hostname: &str) -> Result<bool> {
        let hostname = hostname.to_ascii_lowercase();
        self.update(move |managed| {
            managed.remove(&hostname);
        })
    }

    /// Replace the managed set wholesale
    pub fn sync_all<I, S>(&self, hostnames: I) -> Result<bool>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let target = hostnames
            .into_iter()
            .map(|h| validate_hostname(h.as_ref()))
            .collect::<Result<BTreeSet<_>>>()?;

        self.update(move |managed| *managed = target)
    }

    /// Sync the block with the registry: proxy-enabled hostnames only unless
    /// `include_disabled` is set.
    pub fn sync_registry(&self, registry: &dyn DomainRegistry, include_disabled: bool) -> Result<bool> {
        let hostnames: Vec<String> = registry
            .list_all()?
            .into_iter()
            .filter(|entry| include_disabled || entry.proxy_enabled)
            .map(|entry| entry.hostname)
            .collect();

        self.sync_all(hostnames)
    }

    /// Remove the managed block including its markers
    pub fn clear_all(&self) -> Result<bool> {
        self.update(|managed| managed.clear())
    }

    /// Put the last backup back in place. Returns false when no backup exists.
    pub fn restore_from_backup(&self) -> Result<bool> {
        let _guard = HOSTS_WRITE_LOCK.lock();

        if !self.config.backup_path.exists() {
            info!(backup = %self.config.backup_path.display(), "No hosts backup found");
            return Ok(false);
        }

        self.check_writable()?;
        let snapshot = fs::read(&self.config.backup_path)
            .map_err(|e| Error::hosts_io(&self.config.backup_path, e))?;

        self.write_atomic(&snapshot)?;
        self.flush_dns();

        info!(path = %self.config.path.display(), "Restored hosts file from backup");
        Ok(true)
    }

    fn update<F>(&self, apply: F) -> Result<bool>
    where
        F: FnOnce(&mut BTreeSet<String>),
    {
        let _guard = HOSTS_WRITE_LOCK.lock();

        self.check_writable()?;
        let content = self.read()?;
        let mut block = self.parse(&content)?;

        let previous = block.managed.clone();
        apply(&mut block.managed);
        if block.managed == previous {
            debug!(path = %self.config.path.display(), "Managed hosts unchanged, skipping write");
            return Ok(false);
        }

        let rendered = block.render();
        self.backup(&content);
        self.write_atomic(&rendered)?;
        self.flush_dns();

        info!(
            path = %self.config.path.display(),
            count = block.managed.len(),
            "Updated managed hosts"
        );
        Ok(true)
    }

    fn check_writable(&self) -> Result<()> {
        fs::OpenOptions::new()
            .write(true)
            .open(&self.config.path)
            .map(|_| ())
            .map_err(|e| Error::hosts_io(&self.config.path, e))
    }

    fn read(&self) -> Result<Vec<u8>> {
        fs::read(&self.config.path).map_err(|e| Error::hosts_io(&self.config.path, e))
    }

    fn parse(&self, content: &[u8]) -> Result<HostsBlock> {
        HostsBlock::parse(content).map_err(|malformed| Error::MalformedHostsBlock {
            path: self.config.path.clone(),
            reason: malformed.reason,
        })
    }

    /// Best effort; the previous snapshot survives a failed backup
    fn backup(&self, content: &[u8]) {
        match write_file_atomic(&self.config.backup_path, content, None) {
            Ok(()) => debug!(backup = %self.config.backup_path.display(), "Backed up hosts file"),
            Err(e) => warn!(
                backup = %self.config.backup_path.display(),
                error = %e,
                "Failed to back up hosts file, continuing"
            ),
        }
    }

    /// Replace the hosts file through a temp file in the same directory,
    /// keeping its permissions. On any failure the file is left untouched.
    fn write_atomic(&self, content: &[u8]) -> Result<()> {
        let target = fs::canonicalize(&self.config.path)
            .map_err(|e| Error::hosts_io(&self.config.path, e))?;
        let permissions = fs::metadata(&target)
            .map_err(|e| Error::hosts_io(&target, e))?
            .permissions();

        write_file_atomic(&target, content, Some(permissions)).map_err(|e| Error::hosts_io(&target, e))
    }

    fn flush_dns(&self) {
        if self.config.flush_dns {
            flush_dns_cache();
        }
    }
}

/// Write `content` to a temp file next to `target`, fsync it and rename it
/// over `target`.
fn write_file_atomic(target: &Path, content: &[u8], permissions: Option<fs::Permissions>) -> io::Result<()> {
    let dir = match target.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    if let Some(permissions) = permissions {
        fs::set_permissions(tmp.path(), permissions)?;
    }
    tmp.persist(target).map_err(|e| e.error)?;

    Ok(())
}

const MACOS_FLUSH: &[&[&str]] = &[
    &["dscacheutil", "-flushcache"],
    &["killall", "-HUP", "mDNSResponder"],
];
const WINDOWS_FLUSH: &[&[&str]] = &[&["ipconfig", "/flushdns"]];
const LINUX_FLUSH: &[&[&str]] = &[
    &["resolvectl", "flush-caches"],
    &["systemd-resolve", "--flush-caches"],
];

/// Best-effort flush of the operating system's resolver cache
pub fn flush_dns_cache() {
    // macOS needs both commands; elsewhere the first one that works is enough
    let (commands, run_all) = match std::env::consts::OS {
        "macos" => (MACOS_FLUSH, true),
        "windows" => (WINDOWS_FLUSH, false),
        _ => (LINUX_FLUSH, false),
    };

    for command in commands {
        let (program, args) = match command.split_first() {
            Some(split) => split,
            None => continue,
        };

        match Command::new(program).args(args).output() {
            Ok(output) if output.status.success() => {
                debug!(command = %command.join(" "), "Flushed DNS cache");
                if !run_all {
                    return;
                }
            }
            Ok(output) => debug!(
                command = %command.join(" "),
                status = %output.status,
                "DNS cache flush command failed"
            ),
            Err(e) => debug!(command = %command.join(" "), error = %e, "DNS cache flush unavailable"),
        }
    }
}
