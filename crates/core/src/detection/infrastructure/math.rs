//! Union-find over detection indices.
//!
//! Used to turn a pairwise "overlaps" relation into connected components, so
//! chains of overlapping boxes collapse together rather than pairwise.

/// Find root of element `i` with path halving for amortized near-O(1).
pub fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Merge the sets containing `a` and `b`. The smaller root wins so component
/// roots stay stable with respect to input order.
pub fn union(parent: &mut [usize], a: usize, b: usize) {
    let ra = find(parent, a);
    let rb = find(parent, b);
    if ra != rb {
        let (keep, merge) = if ra < rb { (ra, rb) } else { (rb, ra) };
        parent[merge] = keep;
    }
}

/// Connected components as lists of member indices.
///
/// Members are ascending; components are ordered by their first member.
pub fn components(parent: &mut [usize]) -> Vec<Vec<usize>> {
    let n = parent.len();
    let mut slot_of_root: Vec<Option<usize>> = vec![None; n];
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for i in 0..n {
        let root = find(parent, i);
        match slot_of_root[root] {
            Some(slot) => groups[slot].push(i),
            None => {
                slot_of_root[root] = Some(groups.len());
                groups.push(vec![i]);
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_find_transitive() {
        let mut parent = vec![0, 1, 2];
        union(&mut parent, 0, 1);
        union(&mut parent, 1, 2);
        assert_eq!(find(&mut parent, 0), find(&mut parent, 2));
    }

    #[test]
    fn test_union_find_separate() {
        let mut parent = vec![0, 1, 2, 3];
        union(&mut parent, 0, 1);
        union(&mut parent, 2, 3);
        assert_ne!(find(&mut parent, 0), find(&mut parent, 2));
    }

    #[test]
    fn test_components_ordered_by_first_member() {
        let mut parent: Vec<usize> = (0..5).collect();
        union(&mut parent, 4, 1);
        union(&mut parent, 3, 0);
        assert_eq!(
            components(&mut parent),
            vec![vec![0, 3], vec![1, 4], vec![2]]
        );
    }

    #[test]
    fn test_components_empty() {
        assert!(components(&mut []).is_empty());
    }
}
