//! Rules command implementation.

use ledgersync_protocol::RuleSet;

/// Runs the rules command.
pub fn run() {
    let rules = RuleSet::default();
    println!("Verification rules");
    println!();
    for entity_type in rules.entity_types() {
        let rule = rules.rule_for(&entity_type);
        println!("  {:<14} {}", entity_type.as_str(), rule.required_fields.join(", "));
    }
    println!();
    println!("Every record also needs a non-blank name and a stable id.");
    println!("Other entity types use this predicate with no required fields.");
}
