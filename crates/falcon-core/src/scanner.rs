//! Dependency scanner - seeds the dirty state of a freshly loaded graph
//!
//! One bottom-up pass: hash every source against the hash recorded by the
//! previous run, then walk the rules in topological order and propagate.
//! Runs once at daemon startup; a scan failure aborts startup.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::cache::CacheManager;
use crate::graph::{Graph, RuleId, State};
use crate::hasher;

pub struct DependencyScanner<'a> {
    graph: &'a mut Graph,
    cache: &'a CacheManager,
    working_dir: &'a Path,
}

impl<'a> DependencyScanner<'a> {
    pub fn new(graph: &'a mut Graph, cache: &'a CacheManager, working_dir: &'a Path) -> Self {
        Self {
            graph,
            cache,
            working_dir,
        }
    }

    /// Scan the whole graph. Afterwards every node carries its observed
    /// hash and the dirty-propagation invariant holds.
    pub fn scan(&mut self) -> Result<()> {
        self.attach_depfiles()?;
        self.scan_sources()?;
        self.scan_rules()?;

        let dirty = self
            .graph
            .nodes()
            .filter(|(_, n)| n.is_dirty())
            .count();
        info!(
            "Scanned {} nodes, {} rules: {} nodes out of date",
            self.graph.node_count(),
            self.graph.rule_count(),
            dirty
        );
        Ok(())
    }

    /// Read each rule's depfile and attach the listed paths as implicit
    /// inputs. A depfile that does not exist yet (rule never ran) is empty;
    /// a malformed one is fatal.
    fn attach_depfiles(&mut self) -> Result<()> {
        let with_depfile: Vec<(RuleId, String)> = self
            .graph
            .rules()
            .filter_map(|(id, r)| r.depfile().map(|d| (id, d.to_string())))
            .collect();

        for (rule, depfile) in with_depfile {
            let path = self.working_dir.join(&depfile);
            if !path.exists() {
                continue;
            }
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading depfile {}", depfile))?;
            let deps = parse_depfile(&text)
                .with_context(|| format!("parsing depfile {}", depfile))?;
            for dep in deps {
                let node = self.graph.add_node(&dep);
                self.graph.attach_input(rule, node);
                debug!("implicit input {} -> rule {:?}", dep, rule);
            }
        }
        Ok(())
    }

    /// Hash every source and compare with the hash stored by the previous
    /// run. No stored hash means never seen: out of date.
    fn scan_sources(&mut self) -> Result<()> {
        for id in self.graph.sources() {
            let path = self.graph.node(id).path().to_string();
            let file = self.working_dir.join(&path);

            let hash = self
                .cache
                .hash_file(&file)
                .with_context(|| format!("scanning source {}", path))?;
            let stored = self.cache.stored_hash(&path);
            let clean = stored.as_deref() == Some(hash.as_str());

            let node = self.graph.node_mut(id);
            node.update_hash(hash.clone());
            node.set_previous_hash(stored);
            if let Some(mtime) = hasher::file_mtime(&file) {
                node.update_mtime(mtime);
            }

            if clean {
                self.graph.mark_up_to_date(id);
            } else {
                self.graph.mark_dirty(id);
            }
            self.cache.store_hash(&path, &hash)?;
        }
        Ok(())
    }

    /// Walk rules from sources to roots. A rule is out of date when an
    /// input is, or when one of its output files is missing or disagrees
    /// with the recorded hash. Phony rules have no files to check.
    fn scan_rules(&mut self) -> Result<()> {
        for rule_id in self.graph.rules_topological()? {
            let rule = self.graph.rule(rule_id);
            let phony = rule.is_phony();
            let inputs = rule.inputs().to_vec();
            let outputs = rule.outputs().to_vec();

            let mut dirty = inputs.iter().any(|&i| self.graph.node(i).is_dirty());

            if !phony {
                for &out in &outputs {
                    let path = self.graph.node(out).path().to_string();
                    let file = self.working_dir.join(&path);
                    if !file.exists() {
                        dirty = true;
                        continue;
                    }
                    let hash = self
                        .cache
                        .hash_file(&file)
                        .with_context(|| format!("scanning output {}", path))?;
                    let stored = self.cache.stored_hash(&path);
                    if stored.as_deref() != Some(hash.as_str()) {
                        dirty = true;
                    }
                    let node = self.graph.node_mut(out);
                    node.update_hash(hash);
                    node.set_previous_hash(stored);
                    if let Some(mtime) = hasher::file_mtime(&file) {
                        node.update_mtime(mtime);
                    }
                }
            }

            if dirty {
                self.graph.mark_rule_dirty(rule_id);
            } else {
                for &out in &outputs {
                    self.graph.mark_up_to_date(out);
                }
                self.graph.set_rule_state(rule_id, State::UpToDate);
            }
        }
        Ok(())
    }
}

/// Parse a Makefile-style depfile: `target: dep dep \` with backslash line
/// continuations. Returns the dependency paths of every target.
pub fn parse_depfile(text: &str) -> Result<Vec<String>> {
    let joined = text.replace("\\\r\n", " ").replace("\\\n", " ");
    let mut deps = Vec::new();
    for line in joined.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((_, rest)) = line.split_once(':') else {
            bail!("missing ':' in depfile line: {:?}", line);
        };
        for dep in rest.split_whitespace() {
            deps.push(dep.to_string());
        }
    }
    Ok(deps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_graph;
    use std::fs;

    const SINGLE_RULE: &str = r#"{ "rules": [ { "inputs": ["a.in"],
        "outputs": ["a.out"], "cmd": "cat a.in > a.out" } ] }"#;

    fn setup() -> (tempfile::TempDir, CacheManager) {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::open(dir.path().join(".falcon")).unwrap();
        (dir, cache)
    }

    #[test]
    fn test_first_scan_marks_everything_dirty() {
        let (dir, cache) = setup();
        fs::write(dir.path().join("a.in"), "hi").unwrap();

        let mut graph = parse_graph(SINGLE_RULE).unwrap();
        DependencyScanner::new(&mut graph, &cache, dir.path())
            .scan()
            .unwrap();

        let a_in = graph.node_by_path("a.in").unwrap();
        let a_out = graph.node_by_path("a.out").unwrap();
        assert!(graph.node(a_in).is_dirty(), "no previous hash");
        assert!(graph.node(a_out).is_dirty());
        assert!(graph.node(a_in).hash().is_some());
    }

    #[test]
    fn test_rescan_after_build_is_clean() {
        let (dir, cache) = setup();
        fs::write(dir.path().join("a.in"), "hi").unwrap();

        let mut graph = parse_graph(SINGLE_RULE).unwrap();
        DependencyScanner::new(&mut graph, &cache, dir.path())
            .scan()
            .unwrap();

        // Pretend the build ran: output exists, hash recorded.
        fs::write(dir.path().join("a.out"), "hi").unwrap();
        let hash = cache.hash_file(dir.path().join("a.out")).unwrap();
        cache.store_hash("a.out", &hash).unwrap();

        let mut graph = parse_graph(SINGLE_RULE).unwrap();
        DependencyScanner::new(&mut graph, &cache, dir.path())
            .scan()
            .unwrap();

        let a_in = graph.node_by_path("a.in").unwrap();
        let a_out = graph.node_by_path("a.out").unwrap();
        assert!(!graph.node(a_in).is_dirty());
        assert!(!graph.node(a_out).is_dirty());
    }

    #[test]
    fn test_source_change_dirties_downstream() {
        let (dir, cache) = setup();
        fs::write(dir.path().join("a.in"), "hi").unwrap();
        fs::write(dir.path().join("a.out"), "hi").unwrap();

        let mut graph = parse_graph(SINGLE_RULE).unwrap();
        DependencyScanner::new(&mut graph, &cache, dir.path())
            .scan()
            .unwrap();
        let hash = cache.hash_file(dir.path().join("a.out")).unwrap();
        cache.store_hash("a.out", &hash).unwrap();

        fs::write(dir.path().join("a.in"), "changed").unwrap();

        let mut graph = parse_graph(SINGLE_RULE).unwrap();
        DependencyScanner::new(&mut graph, &cache, dir.path())
            .scan()
            .unwrap();

        let a_in = graph.node_by_path("a.in").unwrap();
        let a_out = graph.node_by_path("a.out").unwrap();
        assert!(graph.node(a_in).is_dirty());
        assert!(graph.node(a_out).is_dirty(), "dirt propagates to outputs");
    }

    #[test]
    fn test_missing_source_is_fatal() {
        let (dir, cache) = setup();
        let mut graph = parse_graph(SINGLE_RULE).unwrap();
        let err = DependencyScanner::new(&mut graph, &cache, dir.path()).scan();
        assert!(err.is_err());
    }

    #[test]
    fn test_depfile_attaches_implicit_inputs() {
        let (dir, cache) = setup();
        fs::write(dir.path().join("m.c"), "int main(){}").unwrap();
        fs::write(dir.path().join("m.h"), "// header").unwrap();
        fs::write(dir.path().join("m.d"), "m.o: m.c m.h\n").unwrap();

        let mut graph = parse_graph(
            r#"{ "rules": [ { "inputs": ["m.c"], "outputs": ["m.o"],
                 "cmd": "cc -c m.c", "depfile": "m.d" } ] }"#,
        )
        .unwrap();
        DependencyScanner::new(&mut graph, &cache, dir.path())
            .scan()
            .unwrap();

        let header = graph.node_by_path("m.h").unwrap();
        let (_, rule) = graph.rules().next().unwrap();
        assert!(rule.is_input(header));
    }

    #[test]
    fn test_malformed_depfile_is_fatal() {
        let (dir, cache) = setup();
        fs::write(dir.path().join("m.c"), "x").unwrap();
        fs::write(dir.path().join("m.d"), "no colon here").unwrap();

        let mut graph = parse_graph(
            r#"{ "rules": [ { "inputs": ["m.c"], "outputs": ["m.o"],
                 "cmd": "cc -c m.c", "depfile": "m.d" } ] }"#,
        )
        .unwrap();
        let err = DependencyScanner::new(&mut graph, &cache, dir.path()).scan();
        assert!(err.is_err());
    }

    #[test]
    fn test_parse_depfile_continuations() {
        let deps = parse_depfile("out/a.o: src/a.c \\\n  src/b.h\n").unwrap();
        assert_eq!(deps, vec!["src/a.c".to_string(), "src/b.h".to_string()]);
    }

    #[test]
    fn test_parse_depfile_empty_deps() {
        let deps = parse_depfile("out/b.o :\n").unwrap();
        assert!(deps.is_empty());
    }
}
