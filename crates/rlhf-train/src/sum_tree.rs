//! Segment tree over slot priorities
//!
//! Keeps two views per slot: `priority^alpha` summed for proportional
//! sampling, and the raw priority maxed for new-experience priorities.
//! Both queries and updates are O(log n).

#[derive(Debug, Clone)]
pub(crate) struct PriorityTree {
    leaves: usize,
    sums: Vec<f64>,
    maxes: Vec<f64>,
}

impl PriorityTree {
    pub fn new(capacity: usize) -> Self {
        let leaves = capacity.max(1).next_power_of_two();
        Self {
            leaves,
            sums: vec![0.0; 2 * leaves],
            maxes: vec![0.0; 2 * leaves],
        }
    }

    /// Set a slot's sampling mass and raw priority
    pub fn set(&mut self, slot: usize, mass: f64, priority: f64) {
        let mut node = slot + self.leaves;
        self.sums[node] = mass;
        self.maxes[node] = priority;

        while node > 1 {
            node /= 2;
            let (left, right) = (2 * node, 2 * node + 1);
            self.sums[node] = self.sums[left] + self.sums[right];
            self.maxes[node] = self.maxes[left].max(self.maxes[right]);
        }
    }

    pub fn total(&self) -> f64 {
        self.sums[1]
    }

    pub fn max_priority(&self) -> f64 {
        self.maxes[1]
    }

    pub fn mass(&self, slot: usize) -> f64 {
        self.sums[slot + self.leaves]
    }

    pub fn priority(&self, slot: usize) -> f64 {
        self.maxes[slot + self.leaves]
    }

    /// Slot whose cumulative mass interval contains `mass`
    pub fn find(&self, mut mass: f64) -> usize {
        let mut node = 1;
        while node < self.leaves {
            let left = 2 * node;
            if mass < self.sums[left] || self.sums[left + 1] <= 0.0 {
                node = left;
            } else {
                mass -= self.sums[left];
                node = left + 1;
            }
        }
        node - self.leaves
    }

    pub fn clear(&mut self) {
        self.sums.iter_mut().for_each(|v| *v = 0.0);
        self.maxes.iter_mut().for_each(|v| *v = 0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_and_max() {
        let mut tree = PriorityTree::new(5);
        tree.set(0, 1.0, 1.0);
        tree.set(3, 4.0, 16.0);
        tree.set(4, 2.0, 4.0);

        assert_eq!(tree.total(), 7.0);
        assert_eq!(tree.max_priority(), 16.0);

        tree.set(3, 0.5, 0.25);
        assert_eq!(tree.total(), 3.5);
        assert_eq!(tree.max_priority(), 4.0);
    }

    #[test]
    fn test_find_walks_cumulative_mass() {
        let mut tree = PriorityTree::new(4);
        tree.set(0, 1.0, 1.0);
        tree.set(1, 2.0, 2.0);
        tree.set(2, 3.0, 3.0);

        assert_eq!(tree.find(0.0), 0);
        assert_eq!(tree.find(0.99), 0);
        assert_eq!(tree.find(1.0), 1);
        assert_eq!(tree.find(2.5), 1);
        assert_eq!(tree.find(3.0), 2);
        assert_eq!(tree.find(5.99), 2);
    }

    #[test]
    fn test_find_never_lands_on_empty_tail() {
        let mut tree = PriorityTree::new(8);
        tree.set(0, 1.0, 1.0);
        tree.set(1, 1.0, 1.0);

        // Rounding can push the query past the total
        assert_eq!(tree.find(2.0 + 1e-12), 1);
    }
}
