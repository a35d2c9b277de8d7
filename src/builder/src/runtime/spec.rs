//! OCI runtime spec generation for RUN instructions.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// OCI runtime spec version written to `config.json`.
pub const OCI_RUNTIME_SPEC_VERSION: &str = "1.0.2";

/// Host files bind-mounted read-only so RUN steps get working DNS.
const HOST_NETWORK_FILES: &[&str] = &["/etc/resolv.conf", "/etc/hosts"];

/// A process to run inside a working container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub container_id: String,
    /// Host path of the container root filesystem
    pub rootfs: PathBuf,
    pub args: Vec<String>,
    /// `KEY=value` entries
    pub env: Vec<String>,
    pub cwd: String,
    pub uid: u32,
    pub gid: u32,
    pub capabilities: Vec<String>,
}

/// OCI Runtime Spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    pub oci_version: String,
    pub root: SpecRoot,
    pub process: SpecProcess,
    pub hostname: String,
    pub mounts: Vec<SpecMount>,
    pub linux: SpecLinux,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecRoot {
    pub path: String,
    pub readonly: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecProcess {
    pub terminal: bool,
    pub user: SpecUser,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub capabilities: SpecCapabilities,
    pub no_new_privileges: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecUser {
    pub uid: u32,
    pub gid: u32,
}

/// Capability sets; the same list is used for every set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecCapabilities {
    pub bounding: Vec<String>,
    pub effective: Vec<String>,
    pub permitted: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecMount {
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecLinux {
    pub namespaces: Vec<SpecNamespace>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecNamespace {
    #[serde(rename = "type")]
    pub ns_type: String,
}

fn mount(destination: &str, mount_type: &str, source: &str, options: &[&str]) -> SpecMount {
    SpecMount {
        destination: destination.to_string(),
        mount_type: mount_type.to_string(),
        source: source.to_string(),
        options: options.iter().map(|o| o.to_string()).collect(),
    }
}

impl RuntimeSpec {
    /// Spec for a RUN step. The container shares the host network; pid,
    /// ipc, uts and mount namespaces are private.
    pub fn for_run(request: &RunRequest) -> Self {
        let caps: Vec<String> = request
            .capabilities
            .iter()
            .map(|c| {
                if c.starts_with("CAP_") {
                    c.clone()
                } else {
                    format!("CAP_{}", c)
                }
            })
            .collect();

        let mut env = request.env.clone();
        if !env.iter().any(|e| e.starts_with("PATH=")) {
            env.push("PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string());
        }

        Self {
            oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
            root: SpecRoot {
                path: request.rootfs.to_string_lossy().into_owned(),
                readonly: false,
            },
            process: SpecProcess {
                terminal: false,
                user: SpecUser {
                    uid: request.uid,
                    gid: request.gid,
                },
                args: request.args.clone(),
                env,
                cwd: if request.cwd.is_empty() {
                    "/".to_string()
                } else {
                    request.cwd.clone()
                },
                capabilities: SpecCapabilities {
                    bounding: caps.clone(),
                    effective: caps.clone(),
                    permitted: caps,
                },
                no_new_privileges: false,
            },
            hostname: "kiln".to_string(),
            mounts: default_mounts(),
            linux: SpecLinux {
                namespaces: ["pid", "ipc", "uts", "mount"]
                    .iter()
                    .map(|ns| SpecNamespace {
                        ns_type: ns.to_string(),
                    })
                    .collect(),
            },
        }
    }
}

fn default_mounts() -> Vec<SpecMount> {
    let mut mounts = vec![
        mount("/proc", "proc", "proc", &[]),
        mount("/dev", "tmpfs", "tmpfs", &["nosuid", "strictatime", "mode=755", "size=65536k"]),
        mount(
            "/dev/pts",
            "devpts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"],
        ),
        mount("/dev/shm", "tmpfs", "shm", &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"]),
        mount("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"]),
        mount("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"]),
    ];
    for file in HOST_NETWORK_FILES {
        if Path::new(file).exists() {
            mounts.push(mount(file, "bind", file, &["rbind", "ro"]));
        }
    }
    mounts
}
