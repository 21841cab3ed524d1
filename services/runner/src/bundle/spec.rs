//! OCI runtime configuration (`config.json`).
//!
//! Only the subset of the runtime spec a function needs is modelled: the
//! process, the root filesystem, the default mounts and the Linux namespaces.
//! The function gets its own pid, ipc, uts, mount, network and cgroup
//! namespaces; network isolation means it has no network access at all.
//!
//! Reference: https://github.com/opencontainers/runtime-spec/blob/main/config.md

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::BundleError;
use crate::image::ImageConfig;

pub const OCI_VERSION: &str = "1.0.2";

/// Name of the configuration file inside a bundle.
pub const CONFIG_FILE: &str = "config.json";

const DEFAULT_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const HOSTNAME: &str = "function";

/// Default capability set, matching what container engines grant.
const DEFAULT_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FSETID",
    "CAP_FOWNER",
    "CAP_MKNOD",
    "CAP_NET_RAW",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETFCAP",
    "CAP_SETPCAP",
    "CAP_NET_BIND_SERVICE",
    "CAP_SYS_CHROOT",
    "CAP_KILL",
    "CAP_AUDIT_WRITE",
];

const MASKED_PATHS: &[&str] = &[
    "/proc/acpi",
    "/proc/asound",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/sys/firmware",
];

const READONLY_PATHS: &[&str] = &[
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

/// The privilege the runner holds, which decides the user namespace setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Running as root: no user namespace, the image's user is honoured.
    Root,
    /// Running unprivileged: a user namespace maps container root to the
    /// invoking user.
    Rootless { uid: u32, gid: u32 },
}

impl Privilege {
    pub fn current() -> Self {
        let uid = nix::unistd::geteuid();
        if uid.is_root() {
            Self::Root
        } else {
            Self::Rootless {
                uid: uid.as_raw(),
                gid: nix::unistd::getegid().as_raw(),
            }
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    pub oci_version: String,
    pub process: Process,
    pub root: Root,
    pub hostname: String,
    pub mounts: Vec<Mount>,
    pub linux: Linux,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    pub terminal: bool,
    pub user: User,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub capabilities: Capabilities,
    pub no_new_privileges: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub uid: u32,
    pub gid: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_gids: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub bounding: Vec<String>,
    pub effective: Vec<String>,
    pub permitted: Vec<String>,
}

impl Default for Capabilities {
    fn default() -> Self {
        let caps: Vec<String> = DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect();
        Self {
            bounding: caps.clone(),
            effective: caps.clone(),
            permitted: caps,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Root {
    pub path: String,
    pub readonly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub destination: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Mount {
    fn new(destination: &str, kind: &str, source: &str, options: &[&str]) -> Self {
        Self {
            destination: destination.to_string(),
            kind: kind.to_string(),
            source: source.to_string(),
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    pub namespaces: Vec<Namespace>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uid_mappings: Vec<IdMapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gid_mappings: Vec<IdMapping>,
    pub masked_paths: Vec<String>,
    pub readonly_paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdMapping {
    #[serde(rename = "containerID")]
    pub container_id: u32,
    #[serde(rename = "hostID")]
    pub host_id: u32,
    pub size: u32,
}

impl Spec {
    /// Build the configuration for running `image` from `rootfs`.
    ///
    /// `rootfs` is only read, to resolve a named image user through the
    /// image's `/etc/passwd` and `/etc/group`.
    pub fn build(
        image: &ImageConfig,
        rootfs: &Path,
        privilege: Privilege,
    ) -> Result<Self, BundleError> {
        let config = image.config.clone().unwrap_or_default();

        let args: Vec<String> = config
            .entrypoint
            .unwrap_or_default()
            .into_iter()
            .chain(config.cmd.unwrap_or_default())
            .collect();
        if args.is_empty() {
            return Err(BundleError::NoCommand);
        }

        let mut env = config.env.unwrap_or_default();
        if !env.iter().any(|e| e.starts_with("PATH=")) {
            env.insert(0, DEFAULT_PATH.to_string());
        }

        let cwd = match config.working_dir.as_deref() {
            None | Some("") => "/".to_string(),
            Some(dir) if dir.starts_with('/') => dir.to_string(),
            Some(dir) => format!("/{dir}"),
        };

        let mut namespaces: Vec<Namespace> = ["pid", "ipc", "uts", "mount", "network", "cgroup"]
            .iter()
            .map(|kind| Namespace {
                kind: kind.to_string(),
            })
            .collect();

        let (user, uid_mappings, gid_mappings) = match privilege {
            Privilege::Root => {
                let user = resolve_user(config.user.as_deref().unwrap_or(""), rootfs)?;
                (user, Vec::new(), Vec::new())
            }
            Privilege::Rootless { uid, gid } => {
                namespaces.push(Namespace {
                    kind: "user".to_string(),
                });
                let map = |host_id| {
                    vec![IdMapping {
                        container_id: 0,
                        host_id,
                        size: 1,
                    }]
                };
                let root = User {
                    uid: 0,
                    gid: 0,
                    additional_gids: Vec::new(),
                };
                (root, map(uid), map(gid))
            }
        };

        Ok(Self {
            oci_version: OCI_VERSION.to_string(),
            process: Process {
                terminal: false,
                user,
                args,
                env,
                cwd,
                capabilities: Capabilities::default(),
                no_new_privileges: true,
            },
            root: Root {
                path: "rootfs".to_string(),
                readonly: false,
            },
            hostname: HOSTNAME.to_string(),
            mounts: default_mounts(privilege),
            linux: Linux {
                namespaces,
                uid_mappings,
                gid_mappings,
                masked_paths: MASKED_PATHS.iter().map(|p| p.to_string()).collect(),
                readonly_paths: READONLY_PATHS.iter().map(|p| p.to_string()).collect(),
            },
        })
    }

    /// Write the configuration into the bundle directory.
    pub fn write(&self, bundle_dir: &Path) -> Result<(), BundleError> {
        let data = serde_json::to_vec_pretty(self).map_err(BundleError::Spec)?;
        fs::write(bundle_dir.join(CONFIG_FILE), data)?;
        Ok(())
    }
}

fn default_mounts(privilege: Privilege) -> Vec<Mount> {
    let rootless = matches!(privilege, Privilege::Rootless { .. });

    let devpts: &[&str] = if rootless {
        &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"]
    } else {
        &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620", "gid=5"]
    };

    // sysfs can't be mounted from an unprivileged user namespace that doesn't
    // own the network namespace; bind the host's read-only instead.
    let sys = if rootless {
        Mount::new("/sys", "none", "/sys", &["rbind", "nosuid", "noexec", "nodev", "ro"])
    } else {
        Mount::new("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"])
    };

    vec![
        Mount::new("/proc", "proc", "proc", &[]),
        Mount::new(
            "/dev",
            "tmpfs",
            "tmpfs",
            &["nosuid", "strictatime", "mode=755", "size=65536k"],
        ),
        Mount::new("/dev/pts", "devpts", "devpts", devpts),
        Mount::new(
            "/dev/shm",
            "tmpfs",
            "shm",
            &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
        ),
        Mount::new("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"]),
        sys,
    ]
}

/// Resolve an image `User` (`name`, `uid`, `name:group`, `uid:gid`) against
/// the image's own account databases.
fn resolve_user(spec: &str, rootfs: &Path) -> Result<User, BundleError> {
    if spec.is_empty() {
        return Ok(User {
            uid: 0,
            gid: 0,
            additional_gids: Vec::new(),
        });
    }

    let (user_part, group_part) = match spec.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (spec, None),
    };

    let unknown = || BundleError::UnknownUser(spec.to_string());

    let (uid, primary_gid) = match user_part.parse::<u32>() {
        Ok(uid) => {
            let gid = lookup(rootfs, "etc/passwd", |fields| {
                if fields.get(2)?.parse::<u32>().ok()? != uid {
                    return None;
                }
                fields.get(3)?.parse::<u32>().ok()
            });
            (uid, gid)
        }
        Err(_) => lookup(rootfs, "etc/passwd", |fields| {
            if *fields.first()? != user_part {
                return None;
            }
            Some((
                fields.get(2)?.parse::<u32>().ok()?,
                fields.get(3)?.parse::<u32>().ok(),
            ))
        })
        .ok_or_else(unknown)?,
    };

    let gid = match group_part {
        None => primary_gid.unwrap_or(0),
        Some(group) => match group.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => lookup(rootfs, "etc/group", |fields| {
                if *fields.first()? != group {
                    return None;
                }
                fields.get(2)?.parse::<u32>().ok()
            })
            .ok_or_else(unknown)?,
        },
    };

    Ok(User {
        uid,
        gid,
        additional_gids: Vec::new(),
    })
}

/// Scan a colon-separated account file inside the image. A file that
/// resolves outside the rootfs, through a symlink at any level, reads as
/// absent.
fn lookup<T>(rootfs: &Path, file: &str, mut matches: impl FnMut(&[&str]) -> Option<T>) -> Option<T> {
    let root = rootfs.canonicalize().ok()?;
    let path = rootfs.join(file).canonicalize().ok()?;
    if !path.starts_with(&root) || !fs::metadata(&path).ok()?.is_file() {
        return None;
    }
    let contents = fs::read_to_string(&path).ok()?;
    contents
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .find_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            matches(&fields[..])
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::oci::ContainerConfig;

    fn image(entrypoint: &[&str], cmd: &[&str]) -> ImageConfig {
        let strings = |v: &[&str]| -> Option<Vec<String>> {
            (!v.is_empty()).then(|| v.iter().map(|s| s.to_string()).collect())
        };
        ImageConfig {
            config: Some(ContainerConfig {
                entrypoint: strings(entrypoint),
                cmd: strings(cmd),
                ..Default::default()
            }),
        }
    }

    fn rootfs_with_accounts() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        fs::write(
            dir.path().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\nfn:x:1000:1001::/home/fn:/bin/sh\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("etc/group"),
            "root:x:0:\nfn:x:1001:\nstaff:x:50:\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_args_are_entrypoint_then_cmd() {
        let rootfs = tempfile::tempdir().unwrap();
        let spec = Spec::build(&image(&["/fn"], &["--flag"]), rootfs.path(), Privilege::Root).unwrap();
        assert_eq!(spec.process.args, vec!["/fn", "--flag"]);
        assert_eq!(spec.process.cwd, "/");
        assert!(!spec.process.terminal);
        assert!(spec.process.env[0].starts_with("PATH="));
        assert!(!spec.root.readonly);
    }

    #[test]
    fn test_no_command_is_an_error() {
        let rootfs = tempfile::tempdir().unwrap();
        let err = Spec::build(&ImageConfig::default(), rootfs.path(), Privilege::Root).unwrap_err();
        assert!(matches!(err, BundleError::NoCommand));
    }

    #[test]
    fn test_image_env_and_workdir() {
        let rootfs = tempfile::tempdir().unwrap();
        let mut config = image(&["/fn"], &[]);
        if let Some(c) = config.config.as_mut() {
            c.env = Some(vec!["PATH=/custom".to_string(), "MODE=fast".to_string()]);
            c.working_dir = Some("work".to_string());
        }
        let spec = Spec::build(&config, rootfs.path(), Privilege::Root).unwrap();
        assert_eq!(spec.process.env, vec!["PATH=/custom", "MODE=fast"]);
        assert_eq!(spec.process.cwd, "/work");
    }

    #[test]
    fn test_rootless_maps_container_root() {
        let rootfs = tempfile::tempdir().unwrap();
        let spec = Spec::build(
            &image(&["/fn"], &[]),
            rootfs.path(),
            Privilege::Rootless { uid: 1234, gid: 567 },
        )
        .unwrap();

        assert!(spec.linux.namespaces.iter().any(|n| n.kind == "user"));
        assert!(spec.linux.namespaces.iter().any(|n| n.kind == "network"));
        assert_eq!(spec.process.user.uid, 0);
        assert_eq!(
            spec.linux.uid_mappings,
            vec![IdMapping {
                container_id: 0,
                host_id: 1234,
                size: 1
            }]
        );
        assert_eq!(spec.linux.gid_mappings[0].host_id, 567);

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["linux"]["uidMappings"][0]["containerID"], 0);
        assert_eq!(json["linux"]["uidMappings"][0]["hostID"], 1234);
        assert_eq!(json["ociVersion"], OCI_VERSION);
        assert_eq!(json["process"]["noNewPrivileges"], true);
    }

    #[test]
    fn test_root_has_no_user_namespace() {
        let rootfs = tempfile::tempdir().unwrap();
        let spec = Spec::build(&image(&["/fn"], &[]), rootfs.path(), Privilege::Root).unwrap();
        assert!(!spec.linux.namespaces.iter().any(|n| n.kind == "user"));
        assert!(spec.linux.uid_mappings.is_empty());
        let json = serde_json::to_value(&spec).unwrap();
        assert!(json["linux"].get("uidMappings").is_none());
    }

    #[test]
    fn test_resolve_user_forms() {
        let rootfs = rootfs_with_accounts();
        let user = |s: &str| resolve_user(s, rootfs.path()).unwrap();

        assert_eq!((user("").uid, user("").gid), (0, 0));
        assert_eq!((user("fn").uid, user("fn").gid), (1000, 1001));
        assert_eq!((user("1000").uid, user("1000").gid), (1000, 1001));
        assert_eq!((user("4242").uid, user("4242").gid), (4242, 0));
        assert_eq!((user("fn:staff").uid, user("fn:staff").gid), (1000, 50));
        assert_eq!((user("7:8").uid, user("7:8").gid), (7, 8));
    }

    #[test]
    fn test_resolve_unknown_user() {
        let rootfs = rootfs_with_accounts();
        assert!(matches!(
            resolve_user("nobody-here", rootfs.path()),
            Err(BundleError::UnknownUser(_))
        ));
        assert!(matches!(
            resolve_user("fn:nogroup", rootfs.path()),
            Err(BundleError::UnknownUser(_))
        ));
    }

    #[test]
    fn test_account_files_outside_rootfs_are_ignored() {
        let host = tempfile::tempdir().unwrap();
        fs::write(host.path().join("passwd"), "host:x:4000:4000::/:/bin/sh\n").unwrap();
        fs::write(host.path().join("group"), "host:x:4000:\n").unwrap();

        let rootfs = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(host.path(), rootfs.path().join("etc")).unwrap();

        assert!(matches!(
            resolve_user("host", rootfs.path()),
            Err(BundleError::UnknownUser(_))
        ));
    }

    #[test]
    fn test_account_files_linked_within_rootfs() {
        let rootfs = rootfs_with_accounts();
        fs::rename(rootfs.path().join("etc"), rootfs.path().join("real-etc")).unwrap();
        std::os::unix::fs::symlink("real-etc", rootfs.path().join("etc")).unwrap();

        let user = resolve_user("fn", rootfs.path()).unwrap();
        assert_eq!((user.uid, user.gid), (1000, 1001));
    }

    #[test]
    fn test_write_config() {
        let dir = tempfile::tempdir().unwrap();
        let spec = Spec::build(&image(&["/fn"], &[]), dir.path(), Privilege::Root).unwrap();
        spec.write(dir.path()).unwrap();

        let raw = fs::read(dir.path().join(CONFIG_FILE)).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(parsed["root"]["path"], "rootfs");
        assert_eq!(parsed["process"]["args"][0], "/fn");
    }
}
