//! Workload and supervisor adaptors that shell out.
//!
//! The package manager installs and refreshes the workload, its admin CLI
//! handles accounts, metrics, TLS and site manager enrolment, and
//! configurable commands control the service. Children are killed if the
//! reconciler's deadline drops them.
//!
//! Backed up data sets are packed as gzipped tarballs on a blocking thread.

use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use maas_operator_core::{OperatorConfig, WorkloadFacts};
use maas_operator_reconciler::{
    AdminAccount, ArchiveKind, Error, Result, Supervisor, TlsFiles, Workload,
};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

const SNAP: &str = "snap";
const SNAP_NAME: &str = "maas";

/// Run `program` to completion and return its stdout.
async fn run<S: AsRef<std::ffi::OsStr>>(
    name: &str,
    program: impl AsRef<std::ffi::OsStr>,
    args: &[S],
) -> std::result::Result<String, String> {
    debug!(command = name, "running");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| format!("failed to spawn: {e}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("exited with {}: {}", output.status, stderr.trim()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Read the first line of a file, `None` if it is absent or empty.
fn first_line(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.lines().next().map(|l| l.trim().to_string()))
        .filter(|l| !l.is_empty())
}

/// Parse `snap list` output into `(version, tracking channel)`.
fn parse_snap_list(stdout: &str) -> Option<(String, String)> {
    stdout
        .lines()
        .skip(1)
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .find(|cols| cols.first() == Some(&SNAP_NAME))
        .and_then(|cols| {
            let version = cols.get(1)?.split('-').next()?.to_string();
            let tracking = (*cols.get(3)?).to_string();
            Some((version, tracking))
        })
}

#[derive(Deserialize)]
struct RegionController {
    system_id: String,
}

/// System ids from `region-controllers read` output, sorted and deduplicated.
fn parse_region_ids(stdout: &str) -> std::result::Result<Vec<String>, String> {
    let regions: Vec<RegionController> =
        serde_json::from_str(stdout).map_err(|e| format!("unexpected output: {e}"))?;
    let ids: BTreeSet<String> = regions.into_iter().map(|r| r.system_id).collect();
    Ok(ids.into_iter().collect())
}

/// Pack the contents of `src` into a gzipped tarball at `dest`.
fn pack(src: &Path, dest: &Path) -> io::Result<()> {
    let encoder = GzEncoder::new(File::create(dest)?, Compression::default());
    let mut tar = tar::Builder::new(encoder);
    tar.append_dir_all(".", src)?;
    tar.into_inner()?.finish()?;
    Ok(())
}

/// Replace the contents of `dest` with the tarball at `src`.
///
/// Returns whether anything was extracted.
fn unpack(src: &Path, dest: &Path) -> io::Result<bool> {
    match std::fs::remove_dir_all(dest) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::fs::create_dir_all(dest)?;
    tar::Archive::new(GzDecoder::new(File::open(src)?)).unpack(dest)?;
    Ok(std::fs::read_dir(dest)?.next().is_some())
}

/// The region controller managed through its snap and admin CLI.
#[derive(Debug, Clone)]
pub struct CommandWorkload {
    bin: PathBuf,
    /// Snap data shared across revisions, e.g. `/var/snap/maas/common`.
    common_dir: PathBuf,
    /// Revision-specific data, e.g. `/var/snap/maas/current`.
    current_dir: PathBuf,
    https_port: u16,
}

impl CommandWorkload {
    #[must_use]
    pub fn from_config(config: &OperatorConfig) -> Self {
        Self {
            bin: config.workload_bin.clone(),
            common_dir: config.config_dir.with_file_name("common"),
            current_dir: config.config_dir.clone(),
            https_port: config.ports.https,
        }
    }

    async fn maas(&self, name: &str, args: &[&str]) -> Result<String> {
        run(name, &self.bin, args)
            .await
            .map_err(|reason| Error::workload(name, reason))
    }

    async fn snap(&self, name: &str, args: &[&str]) -> Result<String> {
        run(name, SNAP, args)
            .await
            .map_err(|reason| Error::workload(name, reason))
    }

    fn tls_enabled(&self) -> Option<bool> {
        let nginx = self.current_dir.join("http").join("regiond.nginx.conf");
        match std::fs::read_to_string(&nginx) {
            Ok(conf) => Some(conf.contains(&format!("listen {}", self.https_port))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                debug!(path = %nginx.display(), error = %e, "cannot read proxy config");
                None
            }
        }
    }

    /// Directory holding a backed up data set.
    fn data_dir(&self, kind: ArchiveKind) -> PathBuf {
        match kind {
            ArchiveKind::Images => self.common_dir.join("maas").join("image-storage"),
            ArchiveKind::Preseeds => self.current_dir.join("preseeds"),
        }
    }

    async fn login(&self, admin: &str, api_url: &str) -> Result<()> {
        let key = self.api_key(admin).await?;
        let endpoint = format!("{}/api/2.0/", api_url.trim_end_matches('/'));
        self.maas("login", &["login", admin, endpoint.as_str(), key.trim()])
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Workload for CommandWorkload {
    async fn facts(&self) -> Result<WorkloadFacts> {
        let listing = run("snap-list", SNAP, &["list", SNAP_NAME]).await.ok();
        let Some((version, channel)) = listing.as_deref().and_then(parse_snap_list) else {
            return Ok(WorkloadFacts::default());
        };

        let data = self.common_dir.join("maas");
        Ok(WorkloadFacts {
            installed_channel: Some(channel),
            version: Some(version),
            enrollment_secret: first_line(&data.join("secret")),
            uuid: first_line(&data.join("maas_uuid")),
            tls_enabled: self.tls_enabled(),
        })
    }

    async fn install(&self, channel: &str) -> Result<()> {
        let channel = format!("--channel={channel}");
        self.snap("install", &["install", SNAP_NAME, channel.as_str()]).await?;
        self.snap("hold", &["refresh", "--hold", SNAP_NAME]).await?;
        Ok(())
    }

    async fn refresh(&self, channel: &str) -> Result<()> {
        let channel = format!("--channel={channel}");
        self.snap("refresh", &["refresh", SNAP_NAME, channel.as_str()])
            .await
            .map(|_| ())
    }

    async fn uninstall(&self) -> Result<()> {
        self.snap("remove", &["remove", SNAP_NAME]).await.map(|_| ())
    }

    async fn create_admin(&self, account: &AdminAccount) -> Result<()> {
        let mut args = vec![
            "createadmin",
            "--username",
            account.username.as_str(),
            "--password",
            account.password.as_str(),
            "--email",
            account.email.as_str(),
        ];
        if let Some(import) = &account.ssh_import {
            args.extend(["--ssh-import", import.as_str()]);
        }
        self.maas("createadmin", &args).await.map(|_| ())
    }

    async fn api_key(&self, username: &str) -> Result<String> {
        self.maas("apikey", &["apikey", "--username", username]).await
    }

    async fn set_metrics(&self, admin: &str, api_url: &str, enabled: bool) -> Result<()> {
        self.login(admin, api_url).await?;
        let value = format!("value={enabled}");
        self.maas(
            "set-config",
            &[admin, "maas", "set-config", "name=prometheus_enabled", value.as_str()],
        )
        .await
        .map(|_| ())
    }

    async fn enable_tls(&self, files: &TlsFiles) -> Result<()> {
        let mut args: Vec<String> = vec!["config-tls".into(), "enable".into(), "--yes".into()];
        if let Some(cacert) = &files.cacert {
            args.push("--cacert".into());
            args.push(cacert.display().to_string());
        }
        args.push(files.key.display().to_string());
        args.push(files.cert.display().to_string());
        run("config-tls", &self.bin, &args)
            .await
            .map(|_| ())
            .map_err(|reason| Error::workload("config-tls", reason))
    }

    async fn disable_tls(&self) -> Result<()> {
        self.maas("config-tls", &["config-tls", "disable"])
            .await
            .map(|_| ())
    }

    async fn enrol_site_manager(&self, token: &str) -> Result<()> {
        self.maas("msm-enrol", &["msm", "enrol", "--yes", token])
            .await
            .map(|_| ())
    }

    async fn region_ids(&self, admin: &str, api_url: &str) -> Result<Vec<String>> {
        self.login(admin, api_url).await?;
        let stdout = self
            .maas("region-controllers", &[admin, "region-controllers", "read"])
            .await?;
        parse_region_ids(&stdout).map_err(|reason| Error::workload("region-controllers", reason))
    }

    async fn archive(&self, kind: ArchiveKind, dest: &Path) -> Result<()> {
        let src = self.data_dir(kind);
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || pack(&src, &dest))
            .await
            .map_err(|e| Error::workload("archive", e.to_string()))?
            .map_err(|e| Error::workload("archive", format!("{}: {e}", kind.label())))?;
        info!(archive = kind.label(), "data archived");
        Ok(())
    }

    async fn restore_archive(&self, kind: ArchiveKind, src: &Path) -> Result<()> {
        let dest = self.data_dir(kind);
        let src = src.to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || unpack(&src, &dest))
            .await
            .map_err(|e| Error::workload("restore-archive", e.to_string()))?
            .map_err(|e| {
                Error::workload(
                    "restore-archive",
                    format!("{} archive is not a valid tarball: {e}", kind.label()),
                )
            })?;
        if !extracted {
            return Err(Error::workload(
                "restore-archive",
                format!("{} archive did not contain any files", kind.label()),
            ));
        }
        Ok(())
    }

    async fn set_controller_id(&self, id: &str) -> Result<()> {
        let path = self.common_dir.join("maas").join("maas_id");
        tokio::fs::write(&path, format!("{id}\n"))
            .await
            .map_err(|e| Error::io(&path, e.to_string()))
    }
}

/// Service control through configured commands.
#[derive(Debug, Clone)]
pub struct CommandSupervisor {
    restart: Vec<String>,
    stop: Vec<String>,
}

impl CommandSupervisor {
    #[must_use]
    pub fn from_config(config: &OperatorConfig) -> Self {
        Self {
            restart: config.restart_command.clone(),
            stop: config.stop_command.clone(),
        }
    }

    async fn control(verb: &str, command: &[String]) -> Result<()> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::service_control(format!("no {verb} command configured")))?;
        run(verb, program, args)
            .await
            .map(|_| ())
            .map_err(|reason| Error::service_control(format!("{verb}: {reason}")))
    }
}

#[async_trait]
impl Supervisor for CommandSupervisor {
    async fn restart(&self) -> Result<()> {
        Self::control("restart", &self.restart).await
    }

    async fn stop(&self) -> Result<()> {
        Self::control("stop", &self.stop).await
    }
}
