//! Join artifacts shared from the primary node to secondary nodes
//!
//! The primary writes three files into the join directory once the control
//! plane is up:
//!
//! - `join-command.sh`: the `kubeadm join ...` line printed by kubeadm
//! - `admin.conf`: admin kubeconfig for the new cluster
//! - `certificate-key`: key that decrypts the uploaded control-plane certs
//!
//! The external provisioning layer copies them to secondary nodes. Secondary
//! nodes never execute the script; it is parsed into a structured
//! [`JoinCommand`] and the join is issued with an explicit argument list.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::Path;

use bootline_common::config::BootPaths;
use bootline_common::{Error, Result};
use tracing::info;

/// Parsed `kubeadm join` command line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinCommand {
    /// `host:port` of the control-plane API
    pub api_endpoint: String,
    /// Bootstrap token (`abcdef.0123456789abcdef`)
    pub token: String,
    /// `sha256:<hex>` CA public key pins
    pub ca_cert_hashes: Vec<String>,
}

impl JoinCommand {
    /// Parse the output of `kubeadm token create --print-join-command`, or a
    /// script containing it. Comment lines and `\` continuations are allowed.
    pub fn parse(script: &str) -> Result<Self> {
        let line = script
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| l.trim_end_matches('\\'))
            .collect::<Vec<_>>()
            .join(" ");
        let mut tokens = line.split_whitespace();

        if tokens.next() != Some("kubeadm") || tokens.next() != Some("join") {
            return Err(Error::configuration(
                "join command must start with `kubeadm join`",
            ));
        }

        let api_endpoint = match tokens.next() {
            Some(endpoint) if !endpoint.starts_with("--") => endpoint.to_string(),
            _ => {
                return Err(Error::configuration(
                    "join command is missing the API endpoint",
                ))
            }
        };

        let mut token = None;
        let mut ca_cert_hashes = Vec::new();
        while let Some(arg) = tokens.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) => (flag, Some(value.to_string())),
                None => (arg, None),
            };
            let mut value = || inline.clone().or_else(|| tokens.next().map(str::to_string));
            match flag {
                "--token" => token = value(),
                "--discovery-token-ca-cert-hash" => ca_cert_hashes.extend(value()),
                // Control-plane flags are added by the joining node itself
                _ => {}
            }
        }

        let token = token
            .ok_or_else(|| Error::configuration("join command is missing --token"))?;
        if !is_bootstrap_token(&token) {
            return Err(Error::configuration(
                "join command carries a malformed bootstrap token",
            ));
        }
        if ca_cert_hashes.is_empty() {
            return Err(Error::configuration(
                "join command is missing --discovery-token-ca-cert-hash",
            ));
        }

        Ok(Self {
            api_endpoint,
            token,
            ca_cert_hashes,
        })
    }

    /// Render as a one-line script
    pub fn to_script(&self) -> String {
        let mut script = format!(
            "#!/bin/sh\nkubeadm join {} --token {}",
            self.api_endpoint, self.token
        );
        for hash in &self.ca_cert_hashes {
            script.push_str(" --discovery-token-ca-cert-hash ");
            script.push_str(hash);
        }
        script.push('\n');
        script
    }
}

/// `[a-z0-9]{6}.[a-z0-9]{16}`
fn is_bootstrap_token(token: &str) -> bool {
    let valid_part = |s: &str, len: usize| {
        s.len() == len
            && s.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    };
    token
        .split_once('.')
        .map(|(id, secret)| valid_part(id, 6) && valid_part(secret, 16))
        .unwrap_or(false)
}

/// Everything a secondary node needs to join the cluster.
///
/// Created once per cluster by the primary and treated as immutable input
/// by secondary nodes.
#[derive(Clone, PartialEq, Eq)]
pub struct ClusterJoinInfo {
    /// `host:port` of the control-plane API
    pub api_endpoint: String,
    /// Bootstrap token
    pub bootstrap_token: String,
    /// CA public key pins
    pub ca_cert_hashes: Vec<String>,
    /// Key that decrypts the uploaded control-plane certificates
    pub certificate_key: String,
    /// Admin kubeconfig contents
    pub admin_credentials: String,
}

impl fmt::Debug for ClusterJoinInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterJoinInfo")
            .field("api_endpoint", &self.api_endpoint)
            .field("bootstrap_token", &"<redacted>")
            .field("ca_cert_hashes", &self.ca_cert_hashes)
            .field("certificate_key", &"<redacted>")
            .field("admin_credentials", &"<redacted>")
            .finish()
    }
}

impl ClusterJoinInfo {
    /// Assemble join info from the pieces kubeadm hands back on the primary
    pub fn new(
        join_command: JoinCommand,
        certificate_key: impl Into<String>,
        admin_credentials: impl Into<String>,
    ) -> Result<Self> {
        let certificate_key = certificate_key.into().trim().to_string();
        if certificate_key.len() != 64 || !certificate_key.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(Error::configuration(
                "certificate key must be 64 hex characters",
            ));
        }
        Ok(Self {
            api_endpoint: join_command.api_endpoint,
            bootstrap_token: join_command.token,
            ca_cert_hashes: join_command.ca_cert_hashes,
            certificate_key,
            admin_credentials: admin_credentials.into(),
        })
    }

    /// The structured join command
    pub fn join_command(&self) -> JoinCommand {
        JoinCommand {
            api_endpoint: self.api_endpoint.clone(),
            token: self.bootstrap_token.clone(),
            ca_cert_hashes: self.ca_cert_hashes.clone(),
        }
    }

    /// Read the three artifacts from the join directory.
    ///
    /// A missing or malformed file is a configuration error: retrying cannot
    /// make it appear.
    pub fn load(paths: &BootPaths) -> Result<Self> {
        let script = read_artifact(&paths.join_command())?;
        let certificate_key = read_artifact(&paths.certificate_key())?;
        let admin_credentials = read_artifact(&paths.admin_credentials())?;

        let join_command = JoinCommand::parse(&script).map_err(|e| match e {
            Error::Configuration { message, .. } => {
                Error::configuration_at(paths.join_command(), message)
            }
            other => other,
        })?;
        Self::new(join_command, certificate_key, admin_credentials).map_err(|e| match e {
            Error::Configuration { message, .. } => {
                Error::configuration_at(paths.certificate_key(), message)
            }
            other => other,
        })
    }

    /// Write the three artifacts, each atomically with mode 0600
    pub fn persist(&self, paths: &BootPaths) -> Result<()> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&paths.join_dir)
            .map_err(|e| {
                Error::fatal(
                    "persist_join_info",
                    format!("failed to create {}: {e}", paths.join_dir.display()),
                )
            })?;

        write_secret(&paths.join_command(), self.join_command().to_script().as_bytes())?;
        write_secret(
            &paths.certificate_key(),
            format!("{}\n", self.certificate_key).as_bytes(),
        )?;
        write_secret(&paths.admin_credentials(), self.admin_credentials.as_bytes())?;

        info!(dir = %paths.join_dir.display(), "Join artifacts written");
        Ok(())
    }
}

fn read_artifact(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(contents) if contents.trim().is_empty() => {
            Err(Error::configuration_at(path, "join artifact is empty"))
        }
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::configuration_at(path, "join artifact is missing"))
        }
        Err(e) => Err(Error::configuration_at(
            path,
            format!("failed to read join artifact: {e}"),
        )),
    }
}

/// Write-then-rename so readers never observe a partial file
pub(crate) fn write_secret(path: &Path, contents: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp-{}", std::process::id()));
    let fail = |e: std::io::Error| {
        Error::fatal(
            "write_secret",
            format!("failed to write {}: {e}", path.display()),
        )
    };

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&tmp)
        .map_err(fail)?;
    file.write_all(contents).map_err(fail)?;
    file.sync_all().map_err(fail)?;
    fs::rename(&tmp, path).map_err(fail)
}
