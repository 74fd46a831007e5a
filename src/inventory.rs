//! Ansible INI inventory: which hosts belong to a section.
//!
//! Only host names are read. `[group:vars]` blocks are skipped and
//! `[group:children]` blocks are expanded. `all` is the union of every group
//! unless the file declares it.
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("failed to read inventory {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("inventory has no section named {0:?}")]
    UnknownSection(String),
}

#[derive(Debug, Default)]
pub struct Inventory {
    /// Section name -> hosts, in file order.
    groups: Vec<(String, Vec<String>)>,
    children: HashMap<String, Vec<String>>,
}

enum Block {
    Hosts(usize),
    Children(String),
    Skip,
}

impl Inventory {
    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        let text = std::fs::read_to_string(path).map_err(|e| InventoryError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let mut inv = Inventory::default();
        // Hosts listed before the first header are ignored.
        let mut block = Block::Skip;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                block = match header.split_once(':') {
                    Some((name, "children")) => {
                        inv.children.entry(name.to_string()).or_default();
                        Block::Children(name.to_string())
                    }
                    Some(_) => Block::Skip,
                    None => Block::Hosts(inv.group_index(header)),
                };
                continue;
            }

            let Some(token) = line.split_whitespace().next() else {
                continue;
            };
            if token.contains('=') {
                continue;
            }

            match &block {
                Block::Hosts(idx) => {
                    let hosts = &mut inv.groups[*idx].1;
                    if !hosts.iter().any(|h| h == token) {
                        hosts.push(token.to_string());
                    }
                }
                Block::Children(name) => {
                    if let Some(children) = inv.children.get_mut(name) {
                        children.push(token.to_string());
                    }
                }
                Block::Skip => {}
            }
        }

        inv
    }

    fn group_index(&mut self, name: &str) -> usize {
        if let Some(idx) = self.groups.iter().position(|(n, _)| n == name) {
            return idx;
        }
        self.groups.push((name.to_string(), Vec::new()));
        self.groups.len() - 1
    }

    /// Hosts in `section`, deduplicated, in file order.
    pub fn hosts(&self, section: &str) -> Result<Vec<String>, InventoryError> {
        let declared = self.groups.iter().any(|(n, _)| n == section)
            || self.children.contains_key(section);

        if !declared {
            if section == "all" {
                let mut out = Vec::new();
                for (_, hosts) in &self.groups {
                    push_unique(&mut out, hosts);
                }
                return Ok(out);
            }
            return Err(InventoryError::UnknownSection(section.to_string()));
        }

        let mut out = Vec::new();
        let mut visited = HashSet::new();
        self.collect(section, &mut out, &mut visited);
        Ok(out)
    }

    fn collect(&self, section: &str, out: &mut Vec<String>, visited: &mut HashSet<String>) {
        if !visited.insert(section.to_string()) {
            return;
        }
        if let Some((_, hosts)) = self.groups.iter().find(|(n, _)| n == section) {
            push_unique(out, hosts);
        }
        if let Some(children) = self.children.get(section) {
            for child in children {
                self.collect(child, out, visited);
            }
        }
    }
}

fn push_unique(out: &mut Vec<String>, hosts: &[String]) {
    for host in hosts {
        if !out.contains(host) {
            out.push(host.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOSTS: &str = "\
[all]
localhost ansible_connection=local
line-xfs-reflink
line-xfs-reflink-dev
line-ext4-4k

[all:vars]
ansible_python_interpreter = \"/usr/bin/python3\"

[baseline]
line-xfs-reflink
line-ext4-4k

[dev]
line-xfs-reflink-dev

[fstests:children]
baseline
dev
";

    #[test]
    fn test_section_hosts_in_file_order() {
        let inv = Inventory::parse(HOSTS);
        assert_eq!(
            inv.hosts("baseline").unwrap(),
            vec!["line-xfs-reflink", "line-ext4-4k"]
        );
        assert_eq!(inv.hosts("dev").unwrap(), vec!["line-xfs-reflink-dev"]);
    }

    #[test]
    fn test_vars_block_is_skipped() {
        let inv = Inventory::parse(HOSTS);
        let all = inv.hosts("all").unwrap();
        assert!(!all.iter().any(|h| h.starts_with("ansible_python_interpreter")));
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_children_are_expanded() {
        let inv = Inventory::parse(HOSTS);
        assert_eq!(
            inv.hosts("fstests").unwrap(),
            vec!["line-xfs-reflink", "line-ext4-4k", "line-xfs-reflink-dev"]
        );
    }

    #[test]
    fn test_implicit_all_is_union() {
        let inv = Inventory::parse("[baseline]\na\nb\n[dev]\nb-dev\na\n");
        assert_eq!(inv.hosts("all").unwrap(), vec!["a", "b", "b-dev"]);
    }

    #[test]
    fn test_duplicate_hosts_collapsed() {
        let inv = Inventory::parse("[baseline]\na\na\nb\n");
        assert_eq!(inv.hosts("baseline").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_unknown_section() {
        let inv = Inventory::parse(HOSTS);
        assert!(matches!(
            inv.hosts("nope").unwrap_err(),
            InventoryError::UnknownSection(_)
        ));
    }

    #[test]
    fn test_children_cycle_terminates() {
        let inv = Inventory::parse("[a:children]\nb\n[b:children]\na\n[b]\nhost1\n");
        assert_eq!(inv.hosts("a").unwrap(), vec!["host1"]);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            Inventory::load(Path::new("/nonexistent/hosts")).unwrap_err(),
            InventoryError::Read { .. }
        ));
    }
}
