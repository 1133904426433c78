//! `eval` and `analyze`: one-shot checks of ads against each other.

use std::fmt::Write as _;

use matchgrid_classad::{Record, Scope, Value, evaluate, parse_expr};
use matchgrid_negotiator::matcher::ATTR_REQUIREMENTS;
use matchgrid_negotiator::{MatchOutcome, RejectReason, is_match};

/// Evaluate `text` with `my` as the current record and `target` as its
/// counterpart.
pub fn eval_text(text: &str, my: &Record, target: Option<&Record>) -> anyhow::Result<Value> {
    let expr = parse_expr(text)?;
    Ok(evaluate(&expr, my, target))
}

/// How one machine answered the job.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub machine: String,
    pub outcome: MatchOutcome,
    /// References in the failing `Requirements` that resolve to nothing.
    pub missing: Vec<String>,
}

pub fn analyze(job: &Record, machines: &[Record]) -> Vec<Verdict> {
    machines
        .iter()
        .enumerate()
        .map(|(i, machine)| {
            let outcome = is_match(job, machine);
            let missing = match &outcome.reject {
                Some(RejectReason::JobRequirements(_)) => unresolved(job, machine),
                Some(RejectReason::MachineRequirements(_)) => unresolved(machine, job),
                None => Vec::new(),
            };
            Verdict {
                machine: machine
                    .lookup_string("Name")
                    .unwrap_or_else(|| format!("#{}", i + 1)),
                outcome,
                missing,
            }
        })
        .collect()
}

/// Attributes `side`'s requirements mention that neither record defines
/// where the reference looks.
fn unresolved(side: &Record, other: &Record) -> Vec<String> {
    let Some(requirements) = side.get(ATTR_REQUIREMENTS) else {
        return vec![ATTR_REQUIREMENTS.to_string()];
    };
    requirements
        .references()
        .into_iter()
        .filter_map(|(scope, name)| match scope {
            Scope::My if !side.contains(&name) => Some(format!("MY.{name}")),
            Scope::Target if !other.contains(&name) => Some(format!("TARGET.{name}")),
            Scope::Unscoped if !side.contains(&name) && !other.contains(&name) => Some(name),
            _ => None,
        })
        .collect()
}

pub fn render(verdicts: &[Verdict]) -> String {
    let mut out = String::new();
    for v in verdicts {
        match &v.outcome.reject {
            None => {
                let _ = writeln!(
                    out,
                    "{}: match (job rank {}, machine rank {})",
                    v.machine, v.outcome.job_rank, v.outcome.machine_rank
                );
            }
            Some(reason) => {
                let _ = write!(out, "{}: no match, {reason}", v.machine);
                if !v.missing.is_empty() {
                    let _ = write!(out, " (undefined: {})", v.missing.join(", "));
                }
                out.push('\n');
            }
        }
    }
    let matched = verdicts.iter().filter(|v| v.outcome.accepted).count();
    let _ = writeln!(out, "{matched} of {} machines match", verdicts.len());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ad(text: &str) -> Record {
        Record::parse(text).unwrap()
    }

    #[test]
    fn eval_uses_both_scopes() {
        let my = ad("[ Memory = 512 ]");
        let target = ad("[ Memory = 2048 ]");
        let v = eval_text("TARGET.Memory - MY.Memory", &my, Some(&target)).unwrap();
        assert_eq!(v, Value::Integer(1536));
        assert_eq!(
            eval_text("TARGET.Memory", &my, None).unwrap(),
            Value::Undefined
        );
        assert!(eval_text("1 +", &my, None).is_err());
    }

    #[test]
    fn analyze_names_the_failing_side_and_missing_attrs() {
        let job = ad("[ Requirements = TARGET.Memory >= 1024 && TARGET.HasGpu ]");
        let machines = vec![
            ad("[ Name = \"big\"; Memory = 4096; HasGpu = true; Requirements = true ]"),
            ad("[ Name = \"nogpu\"; Memory = 4096; Requirements = true ]"),
            ad("[ Name = \"picky\"; Memory = 4096; HasGpu = true; Requirements = TARGET.Owner == \"root\" ]"),
            ad("[ Memory = 8; HasGpu = true; Requirements = true ]"),
        ];
        let verdicts = analyze(&job, &machines);
        assert!(verdicts[0].outcome.accepted);
        assert_eq!(verdicts[1].missing, vec!["TARGET.HasGpu"]);
        assert!(matches!(
            verdicts[2].outcome.reject,
            Some(RejectReason::MachineRequirements(Value::Undefined))
        ));
        assert_eq!(verdicts[2].missing, vec!["TARGET.Owner"]);
        assert_eq!(verdicts[3].machine, "#4");
        assert!(verdicts[3].missing.is_empty());

        let report = render(&verdicts);
        assert!(report.contains("big: match"));
        assert!(report.contains("nogpu: no match, job requirements evaluated to undefined (undefined: TARGET.HasGpu)"));
        assert!(report.ends_with("1 of 4 machines match\n"));
    }

    #[test]
    fn missing_requirements_is_reported() {
        let verdicts = analyze(&ad("[ A = 1 ]"), &[ad("[ Name = \"m\"; Requirements = true ]")]);
        assert_eq!(verdicts[0].missing, vec!["Requirements"]);
    }
}
