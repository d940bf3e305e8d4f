use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};

pub type TaskId = String;

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub module: String,
    pub phase: String,
    /// Dependencies: task ids or provide tokens. A trailing '?' marks the
    /// dependency optional (skipped when nothing provides it).
    pub after: Vec<TaskId>,
    pub provides: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
}

impl Plan {
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::msg(format!("duplicate task id '{}'", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    fn provides_index(&self) -> Result<BTreeMap<&str, &str>> {
        let mut out: BTreeMap<&str, &str> = BTreeMap::new();
        for (id, task) in &self.tasks {
            for p in &task.provides {
                if let Some(existing) = out.insert(p.as_str(), id.as_str()) {
                    return Err(Error::msg(format!(
                        "provide token '{}' is produced by both '{}' and '{}'",
                        p, existing, id
                    )));
                }
            }
        }
        Ok(out)
    }

    fn resolve_dep_maybe<'a>(
        &'a self,
        provides: &BTreeMap<&'a str, &'a str>,
        dep: &'a str,
    ) -> Result<Option<&'a str>> {
        let (dep, optional) = dep
            .strip_suffix('?')
            .map(|d| (d, true))
            .unwrap_or((dep, false));
        if self.tasks.contains_key(dep) {
            return Ok(Some(dep));
        }
        if let Some(&provider) = provides.get(dep) {
            return Ok(Some(provider));
        }
        if optional {
            Ok(None)
        } else {
            Err(Error::msg(format!("unknown dependency '{}'", dep)))
        }
    }

    /// Deterministic topological order of the task set.
    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let provides = self.provides_index()?;

        let mut incoming: BTreeMap<&str, usize> = BTreeMap::new();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (id, task) in &self.tasks {
            incoming.entry(id.as_str()).or_insert(0);
            outgoing.entry(id.as_str()).or_default();
            for dep in &task.after {
                let Some(dep_id) =
                    self.resolve_dep_maybe(&provides, dep.as_str()).map_err(|e| {
                        Error::msg(format!(
                            "task '{}' has invalid dependency '{}': {}",
                            id, dep, e
                        ))
                    })?
                else {
                    continue;
                };
                if outgoing.entry(dep_id).or_default().insert(id.as_str()) {
                    *incoming.entry(id.as_str()).or_insert(0) += 1;
                }
            }
        }

        let mut q: VecDeque<&str> = incoming
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();
        let mut out: Vec<&str> = Vec::with_capacity(self.tasks.len());
        while let Some(n) = q.pop_front() {
            out.push(n);
            if let Some(children) = outgoing.get(n) {
                for &m in children {
                    let slot = incoming.get_mut(m).expect("node must exist");
                    *slot -= 1;
                    if *slot == 0 {
                        q.push_back(m);
                    }
                }
            }
        }

        if out.len() != self.tasks.len() {
            let remaining: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(*k))
                .collect();
            return Err(Error::msg(format!(
                "task graph contains a cycle; remaining nodes: {}",
                remaining.join(", ")
            )));
        }

        Ok(out
            .into_iter()
            .map(|id| self.tasks.get(id).expect("task must exist"))
            .collect())
    }

    pub fn finalize_default(&mut self) -> Result<()> {
        self.add_image_barrier()
    }

    // Any task providing an "image:" token is an image producer. The barrier
    // depends on all of them and provides "image:done", so the emulator gates
    // on one token instead of enumerating the flash tasks.
    fn add_image_barrier(&mut self) -> Result<()> {
        const BARRIER_ID: &str = "core.barrier.image";
        if self.tasks.contains_key(BARRIER_ID) {
            return Ok(());
        }

        let mut deps: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.provides.iter().any(|p| p.starts_with("image:")))
            .map(|t| t.id.clone())
            .collect();
        deps.sort();

        self.add(Task {
            id: BARRIER_ID.into(),
            label: "Image barrier".into(),
            module: "core".into(),
            phase: "barrier".into(),
            after: deps,
            provides: vec!["image:done".into()],
        })
    }

    pub fn to_dot(&self) -> Result<String> {
        let provides = self.provides_index()?;
        let mut out = String::from("digraph plan {\n  rankdir=LR;\n");
        for task in self.tasks.values() {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}:{}\"];\n",
                task.id, task.label, task.module, task.phase
            ));
        }
        for task in self.tasks.values() {
            for dep in &task.after {
                let Some(dep_id) = self.resolve_dep_maybe(&provides, dep.as_str())? else {
                    continue;
                };
                out.push_str(&format!("  \"{}\" -> \"{}\";\n", dep_id, task.id));
            }
        }
        out.push_str("}\n");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, after: &[&str], provides: &[&str]) -> Task {
        Task {
            id: id.into(),
            label: id.into(),
            module: "t".into(),
            phase: "p".into(),
            after: after.iter().map(|s| s.to_string()).collect(),
            provides: provides.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn orders_by_provide_tokens() {
        let mut plan = Plan::default();
        plan.add(task("b", &["x:token"], &[])).unwrap();
        plan.add(task("a", &[], &["x:token"])).unwrap();
        let ids: Vec<_> = plan.ordered().unwrap().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn optional_missing_dependency_is_skipped() {
        let mut plan = Plan::default();
        plan.add(task("only", &["nothing:here?"], &[])).unwrap();
        assert_eq!(plan.ordered().unwrap().len(), 1);
    }

    #[test]
    fn cycle_is_reported() {
        let mut plan = Plan::default();
        plan.add(task("a", &["b"], &[])).unwrap();
        plan.add(task("b", &["a"], &[])).unwrap();
        let err = plan.ordered().unwrap_err().to_string();
        assert!(err.contains("cycle"), "{err}");
    }

    #[test]
    fn image_barrier_collects_image_producers() {
        let mut plan = Plan::default();
        plan.add(task("flash.patch", &[], &["image:patched"])).unwrap();
        plan.add(task("flash.finalize", &["flash.patch"], &["image:flash"]))
            .unwrap();
        plan.finalize_default().unwrap();
        let barrier = plan.get("core.barrier.image").expect("barrier");
        assert_eq!(barrier.after, vec!["flash.finalize", "flash.patch"]);
        assert_eq!(barrier.provides, vec!["image:done"]);
    }
}
