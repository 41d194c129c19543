//! Role planning for new agents

use crate::models::AgentRole;
use std::collections::HashMap;

/// Decides which roles newly created agents take
#[derive(Debug, Clone, Copy)]
pub struct RolePlanner {
    drones_per_sub_queen: usize,
}

impl Default for RolePlanner {
    fn default() -> Self {
        Self::new(4)
    }
}

impl RolePlanner {
    pub fn new(drones_per_sub_queen: usize) -> Self {
        Self {
            drones_per_sub_queen: drones_per_sub_queen.max(1),
        }
    }

    /// Roles for `n` new agents given the roles already in the fleet
    ///
    /// A queen comes first. After that a sub-queen is added whenever there
    /// are fewer than one per `drones_per_sub_queen` drones; every other
    /// slot is a drone.
    pub fn plan(&self, current: &HashMap<AgentRole, usize>, n: usize) -> Vec<AgentRole> {
        let mut queens = current.get(&AgentRole::Queen).copied().unwrap_or(0);
        let mut sub_queens = current.get(&AgentRole::SubQueen).copied().unwrap_or(0);
        let mut drones = current.get(&AgentRole::Drone).copied().unwrap_or(0);

        let mut planned = Vec::with_capacity(n);
        for _ in 0..n {
            let role = if queens == 0 {
                queens += 1;
                AgentRole::Queen
            } else if sub_queens < drones.div_ceil(self.drones_per_sub_queen) {
                sub_queens += 1;
                AgentRole::SubQueen
            } else {
                drones += 1;
                AgentRole::Drone
            };
            planned.push(role);
        }
        planned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queen_first() {
        let plan = RolePlanner::default().plan(&HashMap::new(), 3);
        assert_eq!(plan, vec![AgentRole::Queen, AgentRole::Drone, AgentRole::SubQueen]);
    }

    #[test]
    fn test_sub_queen_per_drone_group() {
        let planner = RolePlanner::new(4);
        let current = HashMap::from([
            (AgentRole::Queen, 1),
            (AgentRole::SubQueen, 1),
            (AgentRole::Drone, 4),
        ]);
        assert_eq!(planner.plan(&current, 1), vec![AgentRole::Drone]);

        let plan = planner.plan(&current, 2);
        assert_eq!(plan, vec![AgentRole::Drone, AgentRole::SubQueen]);
    }

    #[test]
    fn test_zero_requested() {
        assert!(RolePlanner::default().plan(&HashMap::new(), 0).is_empty());
    }
}
