//! Mechanic directives embedded in narrator output.
//!
//! The narrator steers the combat sub-state machine with terse inline
//! notation rather than a tool-call protocol:
//!
//! ```text
//! {{combat: Goblin@narrator+2 hp7 ac13, Shade@narrator+1}}
//! {{harm: Goblin 5}}
//! {{combat_end}}
//! ```
//!
//! Parsing is deliberately fallible and contained: a malformed directive
//! becomes a [`DirectiveError`] that costs only that turn's mechanical
//! side-effect, never the turn or the scheduler.

use crate::combat::CombatantSpec;
use thiserror::Error;

/// A parsed mechanic directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    StartCombat { combatants: Vec<CombatantSpec> },
    EndCombat,
    Harm { name: String, amount: i32 },
}

/// Why a directive could not be parsed or applied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectiveError {
    #[error("unknown directive: {0}")]
    Unknown(String),

    #[error("malformed combatant spec: {0}")]
    MalformedCombatant(String),

    #[error("malformed amount: {0}")]
    MalformedAmount(String),

    #[error("combat directive while no combat is active")]
    NotInCombat,

    #[error("combat is already active")]
    AlreadyInCombat,

    #[error("no combatant named {0}")]
    UnknownTarget(String),
}

/// Extract every `{{...}}` directive from a block of generated text.
///
/// Malformed directives are returned as errors alongside the ones that
/// parsed, so the caller can apply what it can and log the rest.
pub fn extract_directives(text: &str) -> Vec<Result<Directive, DirectiveError>> {
    let mut results = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find("{{") {
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            break;
        };
        results.push(parse_directive(after[..close].trim()));
        rest = &after[close + 2..];
    }

    results
}

fn parse_directive(body: &str) -> Result<Directive, DirectiveError> {
    if body == "combat_end" {
        return Ok(Directive::EndCombat);
    }

    if let Some(list) = body.strip_prefix("combat:") {
        let combatants = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_combatant)
            .collect::<Result<Vec<_>, _>>()?;
        if combatants.is_empty() {
            return Err(DirectiveError::MalformedCombatant(list.trim().to_string()));
        }
        return Ok(Directive::StartCombat { combatants });
    }

    if let Some(spec) = body.strip_prefix("harm:") {
        let mut parts = spec.trim().rsplitn(2, ' ');
        let amount_str = parts.next().unwrap_or_default();
        let name = parts.next().unwrap_or_default().trim();
        if name.is_empty() {
            return Err(DirectiveError::MalformedAmount(spec.trim().to_string()));
        }
        let amount: i32 = amount_str
            .parse()
            .map_err(|_| DirectiveError::MalformedAmount(spec.trim().to_string()))?;
        return Ok(Directive::Harm {
            name: name.to_string(),
            amount,
        });
    }

    Err(DirectiveError::Unknown(body.to_string()))
}

/// Parse one combatant: `Name@agent[+mod|-mod] [hpN] [acN]`.
fn parse_combatant(spec: &str) -> Result<CombatantSpec, DirectiveError> {
    let malformed = || DirectiveError::MalformedCombatant(spec.to_string());

    let mut tokens = spec.split_whitespace();
    let head = tokens.next().ok_or_else(malformed)?;

    let (name, tail) = head.split_once('@').ok_or_else(malformed)?;
    if name.is_empty() || tail.is_empty() {
        return Err(malformed());
    }

    // The modifier sign, if present, separates agent from modifier.
    let (agent, modifier) = match tail.find(['+', '-']) {
        Some(pos) => {
            let modifier: i32 = tail[pos..].parse().map_err(|_| malformed())?;
            (&tail[..pos], modifier)
        }
        None => (tail, 0),
    };
    if agent.is_empty() {
        return Err(malformed());
    }

    let mut combatant = CombatantSpec::new(name, agent, modifier);
    for token in tokens {
        if let Some(hp) = token.strip_prefix("hp") {
            combatant = combatant.with_hp(hp.parse().map_err(|_| malformed())?);
        } else if let Some(ac) = token.strip_prefix("ac") {
            combatant = combatant.with_armor_class(ac.parse().map_err(|_| malformed())?);
        } else {
            return Err(malformed());
        }
    }

    Ok(combatant)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_combat_start() {
        let text = "Steel rings out! {{combat: Goblin@narrator+2 hp7 ac13, Rogue@rogue+3}}";
        let directives = extract_directives(text);

        assert_eq!(directives.len(), 1);
        let Ok(Directive::StartCombat { combatants }) = &directives[0] else {
            panic!("expected combat start, got {:?}", directives[0]);
        };
        assert_eq!(combatants.len(), 2);
        assert_eq!(combatants[0].name, "Goblin");
        assert_eq!(combatants[0].agent, "narrator");
        assert_eq!(combatants[0].initiative_modifier, 2);
        assert_eq!(combatants[0].max_hp, 7);
        assert_eq!(combatants[0].armor_class, 13);
        assert_eq!(combatants[1].initiative_modifier, 3);
        assert_eq!(combatants[1].max_hp, 10);
    }

    #[test]
    fn test_parse_negative_modifier() {
        let directives = extract_directives("{{combat: Zombie@narrator-1}}");
        let Ok(Directive::StartCombat { combatants }) = &directives[0] else {
            panic!("expected combat start");
        };
        assert_eq!(combatants[0].initiative_modifier, -1);
    }

    #[test]
    fn test_parse_harm_and_end() {
        let text = "{{harm: Goblin 5}} The goblin staggers. {{combat_end}}";
        let directives = extract_directives(text);

        assert_eq!(
            directives[0],
            Ok(Directive::Harm {
                name: "Goblin".to_string(),
                amount: 5
            })
        );
        assert_eq!(directives[1], Ok(Directive::EndCombat));
    }

    #[test]
    fn test_harm_name_with_spaces() {
        let directives = extract_directives("{{harm: Dire Wolf 3}}");
        assert_eq!(
            directives[0],
            Ok(Directive::Harm {
                name: "Dire Wolf".to_string(),
                amount: 3
            })
        );
    }

    #[test]
    fn test_malformed_directive_is_an_error_not_a_panic() {
        let directives = extract_directives("{{combat: Goblin+2}} {{harm: Goblin lots}}");

        assert!(matches!(
            directives[0],
            Err(DirectiveError::MalformedCombatant(_))
        ));
        assert!(matches!(
            directives[1],
            Err(DirectiveError::MalformedAmount(_))
        ));
    }

    #[test]
    fn test_unknown_directive() {
        let directives = extract_directives("{{weather: rain}}");
        assert!(matches!(directives[0], Err(DirectiveError::Unknown(_))));
    }

    #[test]
    fn test_text_without_directives() {
        assert!(extract_directives("Just narration, no mechanics.").is_empty());
        assert!(extract_directives("An unclosed {{combat: brace").is_empty());
    }

    #[test]
    fn test_mixed_good_and_bad() {
        let text = "{{harm: Goblin 2}} {{harm: Goblin many}} {{combat_end}}";
        let directives = extract_directives(text);
        assert_eq!(directives.len(), 3);
        assert!(directives[0].is_ok());
        assert!(directives[1].is_err());
        assert!(directives[2].is_ok());
    }
}
