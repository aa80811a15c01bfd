//! The combat sub-state machine.
//!
//! While combat is tactical the session's rotation is replaced by an
//! initiative-sorted order; the pre-combat queue is untouched the whole
//! time, so ending combat restores it exactly. Initiative is rolled once -
//! ties keep the original queue order rather than re-rolling, which keeps
//! the ordering deterministic under a scripted roller.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from combat lifecycle operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CombatError {
    #[error("combat is already active")]
    AlreadyActive,

    #[error("combat needs at least one combatant")]
    NoCombatants,
}

/// How combat is currently being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CombatMode {
    /// Freeform narration; the normal rotation applies.
    Narrative,
    /// Initiative order and round tracking apply.
    Tactical,
}

/// Source of d20 rolls. Injectable so initiative is testable.
pub trait Roller: Send {
    fn d20(&mut self) -> i32;
}

/// A `rand`-backed roller.
#[derive(Debug)]
pub struct RandRoller {
    rng: StdRng,
}

impl RandRoller {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandRoller {
    fn default() -> Self {
        Self::new()
    }
}

impl Roller for RandRoller {
    fn d20(&mut self) -> i32 {
        self.rng.gen_range(1..=20)
    }
}

/// A combatant as declared at combat start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombatantSpec {
    /// Display name, unique within the encounter.
    pub name: String,

    /// Agent who speaks for this combatant (the narrator for its creatures).
    pub agent: String,

    pub initiative_modifier: i32,

    pub max_hp: i32,

    pub armor_class: u8,
}

impl CombatantSpec {
    pub fn new(name: impl Into<String>, agent: impl Into<String>, modifier: i32) -> Self {
        Self {
            name: name.into(),
            agent: agent.into(),
            initiative_modifier: modifier,
            max_hp: 10,
            armor_class: 10,
        }
    }

    pub fn with_hp(mut self, hp: i32) -> Self {
        self.max_hp = hp;
        self
    }

    pub fn with_armor_class(mut self, ac: u8) -> Self {
        self.armor_class = ac;
        self
    }
}

/// A participant in active combat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Combatant {
    pub name: String,
    pub agent: String,
    pub initiative_modifier: i32,
    pub initiative: i32,
    pub current_hp: i32,
    pub max_hp: i32,
    pub armor_class: u8,
}

/// Combat state attached to a session while an encounter is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombatState {
    pub mode: CombatMode,
    pub round: u32,
    pub max_rounds: u32,
    combatants: Vec<Combatant>,
    initiative_order: Vec<String>,
}

impl CombatState {
    /// Start a tactical encounter, rolling initiative immediately.
    ///
    /// `specs` must already be in original-queue order; that order is the
    /// tie-break.
    pub fn new(
        specs: Vec<CombatantSpec>,
        max_rounds: u32,
        roller: &mut dyn Roller,
    ) -> Result<Self, CombatError> {
        if specs.is_empty() {
            return Err(CombatError::NoCombatants);
        }

        let mut combatants: Vec<Combatant> = specs
            .into_iter()
            .map(|s| {
                let roll = roller.d20() + s.initiative_modifier;
                Combatant {
                    name: s.name,
                    agent: s.agent,
                    initiative_modifier: s.initiative_modifier,
                    initiative: roll,
                    current_hp: s.max_hp,
                    max_hp: s.max_hp,
                    armor_class: s.armor_class,
                }
            })
            .collect();

        // Stable sort: equal results keep the original queue order.
        combatants.sort_by(|a, b| b.initiative.cmp(&a.initiative));
        let initiative_order = combatants.iter().map(|c| c.agent.clone()).collect();

        Ok(Self {
            mode: CombatMode::Tactical,
            round: 1,
            max_rounds,
            combatants,
            initiative_order,
        })
    }

    /// Agent ids in initiative order, one slot per combatant.
    pub fn initiative_order(&self) -> &[String] {
        &self.initiative_order
    }

    pub fn combatants(&self) -> &[Combatant] {
        &self.combatants
    }

    pub fn combatant(&self, name: &str) -> Option<&Combatant> {
        self.combatants.iter().find(|c| c.name == name)
    }

    /// Called when the rotation wraps. Returns true while combat may
    /// continue; false once the round cap is exceeded.
    pub fn next_round(&mut self) -> bool {
        self.round += 1;
        self.round <= self.max_rounds
    }

    pub fn apply_damage(&mut self, name: &str, amount: i32) -> Option<i32> {
        let combatant = self.combatants.iter_mut().find(|c| c.name == name)?;
        combatant.current_hp -= amount;
        Some(combatant.current_hp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRoller(Vec<i32>, usize);

    impl FixedRoller {
        fn new(values: Vec<i32>) -> Self {
            Self(values, 0)
        }
    }

    impl Roller for FixedRoller {
        fn d20(&mut self) -> i32 {
            let v = self.0[self.1];
            self.1 += 1;
            v
        }
    }

    fn specs() -> Vec<CombatantSpec> {
        vec![
            CombatantSpec::new("Rogue", "rogue", 3),
            CombatantSpec::new("Bard", "bard", 1),
            CombatantSpec::new("Goblin", "narrator", 2).with_hp(7),
        ]
    }

    #[test]
    fn test_initiative_sorts_descending() {
        // Rolls: rogue 10+3=13, bard 18+1=19, goblin 5+2=7.
        let mut roller = FixedRoller::new(vec![10, 18, 5]);
        let combat = CombatState::new(specs(), 10, &mut roller).unwrap();

        assert_eq!(combat.initiative_order(), ["bard", "rogue", "narrator"]);
        assert_eq!(combat.combatants()[0].initiative, 19);
    }

    #[test]
    fn test_ties_keep_original_queue_order() {
        // Rogue 12+3=15, bard 14+1=15, goblin 13+2=15: all tied.
        let mut roller = FixedRoller::new(vec![12, 14, 13]);
        let combat = CombatState::new(specs(), 10, &mut roller).unwrap();

        assert_eq!(combat.initiative_order(), ["rogue", "bard", "narrator"]);
    }

    #[test]
    fn test_round_cap() {
        let mut roller = FixedRoller::new(vec![1, 1, 1]);
        let mut combat = CombatState::new(specs(), 2, &mut roller).unwrap();

        assert!(combat.next_round()); // round 2
        assert!(!combat.next_round()); // round 3 exceeds the cap
        assert_eq!(combat.round, 3);
    }

    #[test]
    fn test_empty_combatant_list_rejected() {
        let mut roller = FixedRoller::new(vec![]);
        assert_eq!(
            CombatState::new(Vec::new(), 10, &mut roller).unwrap_err(),
            CombatError::NoCombatants
        );
    }

    #[test]
    fn test_apply_damage() {
        let mut roller = FixedRoller::new(vec![10, 10, 10]);
        let mut combat = CombatState::new(specs(), 10, &mut roller).unwrap();

        assert_eq!(combat.apply_damage("Goblin", 5), Some(2));
        assert_eq!(combat.apply_damage("Nobody", 5), None);
    }

    #[test]
    fn test_seeded_roller_is_reproducible() {
        let mut a = RandRoller::seeded(42);
        let mut b = RandRoller::seeded(42);
        let rolls_a: Vec<i32> = (0..10).map(|_| a.d20()).collect();
        let rolls_b: Vec<i32> = (0..10).map(|_| b.d20()).collect();

        assert_eq!(rolls_a, rolls_b);
        assert!(rolls_a.iter().all(|r| (1..=20).contains(r)));
    }
}
