//! Process discovery through `/proc/<pid>/cmdline`

use regex::Regex;
use std::path::Path;

/// Command line of a process with NUL separators replaced by spaces
pub fn read_cmdline(proc_root: &Path, pid: u32) -> Option<String> {
    let raw = std::fs::read(proc_root.join(pid.to_string()).join("cmdline")).ok()?;
    let line: Vec<String> = raw
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect();
    if line.is_empty() {
        None
    } else {
        Some(line.join(" "))
    }
}

/// Pids (other than our own) whose command line matches `pattern`
pub fn find_matching(proc_root: &Path, pattern: &Regex) -> Vec<u32> {
    let own = std::process::id();
    let Ok(entries) = std::fs::read_dir(proc_root) else {
        return Vec::new();
    };
    let mut pids: Vec<u32> = entries
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse::<u32>().ok()))
        .filter(|pid| *pid != own)
        .filter(|pid| read_cmdline(proc_root, *pid).is_some_and(|line| pattern.is_match(&line)))
        .collect();
    pids.sort_unstable();
    pids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_process(root: &Path, pid: u32, argv: &[&str]) {
        let dir = root.join(pid.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        let mut raw = argv.join("\0").into_bytes();
        raw.push(0);
        std::fs::write(dir.join("cmdline"), raw).unwrap();
    }

    #[test]
    fn test_find_matching() {
        let root = tempfile::tempdir().unwrap();
        fake_process(
            root.path(),
            41,
            &["ceph-osd", "--foreground", "--osd-uuid=aaaa-bbbb"],
        );
        fake_process(root.path(), 42, &["ceph-mon", "--name=mon.mon0"]);
        std::fs::create_dir_all(root.path().join("self")).unwrap();
        std::fs::create_dir_all(root.path().join("43")).unwrap();

        let pattern = Regex::new(&regex::escape("--osd-uuid=aaaa-bbbb")).unwrap();
        assert_eq!(find_matching(root.path(), &pattern), vec![41]);
        assert_eq!(
            read_cmdline(root.path(), 42).as_deref(),
            Some("ceph-mon --name=mon.mon0")
        );
        assert!(read_cmdline(root.path(), 43).is_none());
    }
}
