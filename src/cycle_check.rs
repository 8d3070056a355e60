use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// Find a dependency cycle among tasks.
///
/// `tasks` yields each task key with the keys it depends on. Keys are task
/// names or node indices. Returns the cycle as a path that starts and ends
/// with the same key, or `None` when the graph is acyclic. Dependencies on
/// keys that are not listed are ignored here.
pub fn find_cycle<K, I, D>(tasks: I) -> Option<Vec<K>>
where
    K: Copy + Eq + Hash,
    I: IntoIterator<Item = (K, D)>,
    D: IntoIterator<Item = K>,
{
    let mut order = Vec::new();
    let mut edges: HashMap<K, Vec<K>> = HashMap::new();
    for (key, deps) in tasks {
        order.push(key);
        edges.entry(key).or_default().extend(deps);
    }

    let mut visited = HashSet::new();
    let mut stack = Vec::new();

    fn dfs<K: Copy + Eq + Hash>(
        key: K,
        edges: &HashMap<K, Vec<K>>,
        visited: &mut HashSet<K>,
        stack: &mut Vec<K>,
    ) -> Option<Vec<K>> {
        if let Some(pos) = stack.iter().position(|k| *k == key) {
            let mut cycle = stack[pos..].to_vec();
            cycle.push(key);
            return Some(cycle);
        }
        if !visited.insert(key) {
            return None;
        }

        stack.push(key);
        if let Some(deps) = edges.get(&key) {
            for &dep in deps {
                if !edges.contains_key(&dep) {
                    continue;
                }
                if let Some(cycle) = dfs(dep, edges, visited, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        None
    }

    for key in order {
        if let Some(cycle) = dfs(key, &edges, &mut visited, &mut stack) {
            return Some(cycle);
        }
    }
    None
}
