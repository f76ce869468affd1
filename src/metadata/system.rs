//! Process and host facts collected once per transport.

use std::fs;

use lazy_static::lazy_static;
use regex::Regex;

const CGROUP_PATH: &str = "/proc/self/cgroup";

lazy_static! {
    static ref CONTAINER_ID_RE: Regex =
        Regex::new(r"^([0-9a-f]{64}|[0-9a-f]{32}-[0-9]{10})$").expect("failed creating regex");
    static ref POD_UID_RE: Regex = Regex::new(
        r"kubepods.*?[/-]pod([0-9a-f]{8}[-_][0-9a-f]{4}[-_][0-9a-f]{4}[-_][0-9a-f]{4}[-_][0-9a-f]{12})(?:\.slice)?(?:/|$)"
    )
    .expect("failed creating regex");
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgroupInfo {
    pub container_id: Option<String>,
    pub pod_uid: Option<String>,
}

/// Extracts container and pod identifiers from `/proc/self/cgroup` contents.
#[must_use]
pub fn parse_cgroup(contents: &str) -> CgroupInfo {
    let mut info = CgroupInfo::default();
    for line in contents.lines() {
        // hierarchy-id:controllers:path
        let Some(path) = line.splitn(3, ':').nth(2) else {
            continue;
        };

        if info.pod_uid.is_none() {
            if let Some(captures) = POD_UID_RE.captures(path) {
                info.pod_uid = Some(captures[1].replace('_', "-"));
            }
        }

        if info.container_id.is_none() {
            let basename = path.rsplit('/').next().unwrap_or_default();
            // systemd scopes look like `docker-<id>.scope` or `cri-containerd-<id>.scope`
            let candidate = match basename.strip_suffix(".scope") {
                Some(scope) => scope.rsplit('-').next().unwrap_or_default(),
                None => basename,
            };
            if CONTAINER_ID_RE.is_match(candidate) {
                info.container_id = Some(candidate.to_string());
            }
        }
    }
    info
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemInfo {
    pub pid: u32,
    pub ppid: Option<u32>,
    pub title: String,
    pub argv: Vec<String>,
    pub architecture: String,
    pub platform: String,
    pub detected_hostname: Option<String>,
    pub cgroup: CgroupInfo,
}

impl SystemInfo {
    #[must_use]
    pub fn detect() -> Self {
        let argv: Vec<String> = std::env::args().collect();
        let title = argv
            .first()
            .and_then(|arg0| arg0.rsplit('/').next())
            .unwrap_or_default()
            .to_string();
        let detected_hostname = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .map(|name| name.trim().to_lowercase())
            .filter(|name| !name.is_empty());
        let cgroup = fs::read_to_string(CGROUP_PATH)
            .map(|contents| parse_cgroup(&contents))
            .unwrap_or_default();

        SystemInfo {
            pid: std::process::id(),
            ppid: parent_pid(),
            title,
            argv,
            architecture: std::env::consts::ARCH.to_string(),
            platform: std::env::consts::OS.to_string(),
            detected_hostname,
            cgroup,
        }
    }
}

#[cfg(unix)]
fn parent_pid() -> Option<u32> {
    Some(std::os::unix::process::parent_id())
}

#[cfg(not(unix))]
fn parent_pid() -> Option<u32> {
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_cgroup_v1() {
        let contents = "12:devices:/docker/051e2ee0bce99116029a13df4a9e943137f19f957f38ac02d6bad96f9b700f76\n\
                        11:hugetlb:/docker/051e2ee0bce99116029a13df4a9e943137f19f957f38ac02d6bad96f9b700f76\n";
        let info = parse_cgroup(contents);
        assert_eq!(
            info.container_id.as_deref(),
            Some("051e2ee0bce99116029a13df4a9e943137f19f957f38ac02d6bad96f9b700f76")
        );
        assert_eq!(info.pod_uid, None);
    }

    #[test]
    fn test_systemd_scope() {
        let contents = "1:name=systemd:/system.slice/docker-cde7c2bab394630a42d73dc610b9c57415dced996106665d427f6d0566594411.scope\n";
        let info = parse_cgroup(contents);
        assert_eq!(
            info.container_id.as_deref(),
            Some("cde7c2bab394630a42d73dc610b9c57415dced996106665d427f6d0566594411")
        );
    }

    #[test]
    fn test_kubernetes_pod() {
        let contents = "1:name=systemd:/kubepods/besteffort/pode9b90526-f47d-11e8-b2a5-080027b9f4fb/15aa6e53-b09a-40c7-8558-c6c31e36c88a\n";
        let info = parse_cgroup(contents);
        assert_eq!(
            info.pod_uid.as_deref(),
            Some("e9b90526-f47d-11e8-b2a5-080027b9f4fb")
        );
        assert_eq!(info.container_id, None);

        let contents = "1:name=systemd:/kubepods.slice/kubepods-burstable.slice/kubepods-burstable-pod90d81341_92de_11e7_8cf2_507b9d4141fa.slice/crio-2227daf62df6694645fee5df53c1f91271546a9560e8600a525690ae252b7f63.scope\n";
        let info = parse_cgroup(contents);
        assert_eq!(
            info.container_id.as_deref(),
            Some("2227daf62df6694645fee5df53c1f91271546a9560e8600a525690ae252b7f63")
        );
        assert_eq!(
            info.pod_uid.as_deref(),
            Some("90d81341-92de-11e7-8cf2-507b9d4141fa")
        );
    }

    #[test]
    fn test_ecs_fargate() {
        let contents = "1:name=systemd:/ecs/46686c7c701cdfdf2549f88f7b9575e9/46686c7c701cdfdf2549f88f7b9575e9-2574839563\n";
        let info = parse_cgroup(contents);
        assert_eq!(
            info.container_id.as_deref(),
            Some("46686c7c701cdfdf2549f88f7b9575e9-2574839563")
        );
    }

    #[test]
    fn test_not_in_container() {
        assert_eq!(parse_cgroup("0::/\n"), CgroupInfo::default());
        assert_eq!(parse_cgroup("garbage"), CgroupInfo::default());
    }

    #[test]
    fn test_detect() {
        let info = SystemInfo::detect();
        assert_eq!(info.pid, std::process::id());
        assert!(!info.platform.is_empty());
        assert!(!info.argv.is_empty());
    }
}
