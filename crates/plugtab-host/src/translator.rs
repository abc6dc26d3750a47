//! Planner-to-constraint translation.
//!
//! `plan_scan` runs at statement preparation time and turns the planner's
//! [`IndexInfo`] into an opaque plan string plus argument slots;
//! `load_plan` runs at filter time and rehydrates the plan into a
//! [`QueryConstraint`] with the argument values filled in.

use serde::{Deserialize, Serialize};

use plugtab_common::constraint::like_to_glob;
use plugtab_common::{
    ColumnConstraint, ConstraintOp, OrderConstraint, PlugError, QueryConstraint, Result,
    TableDescriptor, Value,
};

use crate::vtab::{IndexInfo, IndexPlan, RawOp};

/// One planned predicate: either an argument slot filled at filter time or
/// a value fixed at plan time (null tests).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PlanEntry {
    column: usize,
    op: ConstraintOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arg: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
}

/// The serialized form travelling inside [`IndexPlan::plan`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ScanPlan {
    #[serde(default)]
    constraints: Vec<PlanEntry>,
    #[serde(default)]
    order_by: Vec<OrderConstraint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    limit_arg: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    offset_arg: Option<usize>,
}

/// Plan a scan against a table's schema.
///
/// Every usable constraint the wire protocol can express is forwarded;
/// pushdown stays advisory (the cursor re-filters), so nothing is marked
/// as consumed except the OFFSET pseudo constraint when the table declared
/// it handles offsets itself. Required parameter columns must be bound by
/// a usable equality or the statement fails to prepare.
pub fn plan_scan(descriptor: &TableDescriptor, info: &IndexInfo) -> Result<IndexPlan> {
    let mut plan = ScanPlan::default();
    let mut used = vec![None; info.constraints.len()];
    let mut next_arg = 0usize;
    let mut bound_params: Vec<usize> = Vec::new();

    for (i, constraint) in info.constraints.iter().enumerate() {
        if !constraint.usable {
            continue;
        }

        // LIMIT and OFFSET are pseudo constraints whose column field is
        // meaningless (engines report them with a negative column), so
        // they are handled before any column bounds check.
        match constraint.op {
            RawOp::Limit => {
                plan.limit_arg = Some(next_arg);
                used[i] = Some(next_arg);
                next_arg += 1;
                continue;
            }
            RawOp::Offset => {
                // Only consume the offset when the plugin applies it; an
                // unconsumed offset is applied by the engine itself.
                if descriptor.handles_offset {
                    plan.offset_arg = Some(next_arg);
                    used[i] = Some(next_arg);
                    next_arg += 1;
                }
                continue;
            }
            _ => {}
        }

        if constraint.column < 0 {
            continue;
        }
        let column = constraint.column as usize;
        if column >= descriptor.columns.len() {
            continue;
        }

        // Null tests carry their value in the plan itself; everything else
        // takes the next argument slot.
        let (op, fixed) = match constraint.op {
            RawOp::Eq | RawOp::Is => (ConstraintOp::Eq, None),
            RawOp::Ne | RawOp::IsNot => (ConstraintOp::Ne, None),
            RawOp::Gt => (ConstraintOp::Gt, None),
            RawOp::Ge => (ConstraintOp::Ge, None),
            RawOp::Lt => (ConstraintOp::Lt, None),
            RawOp::Le => (ConstraintOp::Le, None),
            RawOp::Match => (ConstraintOp::Match, None),
            RawOp::Like => (ConstraintOp::Like, None),
            RawOp::Glob => (ConstraintOp::Glob, None),
            RawOp::Regexp => (ConstraintOp::Regexp, None),
            RawOp::IsNull => (ConstraintOp::Eq, Some(Value::Null)),
            RawOp::IsNotNull => (ConstraintOp::Ne, Some(Value::Null)),
            RawOp::Limit | RawOp::Offset => continue,
        };

        if op == ConstraintOp::Eq && fixed.is_none() {
            bound_params.push(column);
        }

        let arg = if fixed.is_none() {
            let slot = next_arg;
            used[i] = Some(slot);
            next_arg += 1;
            Some(slot)
        } else {
            None
        };
        plan.constraints.push(PlanEntry {
            column,
            op,
            arg,
            value: fixed,
        });
    }

    for (column, spec) in descriptor.columns.iter().enumerate() {
        if spec.is_required && !bound_params.contains(&column) {
            return Err(PlugError::Constraint(format!(
                "required parameter \"{}\" must be constrained with =",
                spec.name
            )));
        }
    }

    plan.order_by = info
        .order_by
        .iter()
        .filter(|o| o.column >= 0)
        .map(|o| OrderConstraint {
            column: o.column as usize,
            descending: o.descending,
        })
        .collect();

    let plan = serde_json::to_string(&plan)
        .map_err(|e| PlugError::Protocol(e.to_string()))?;
    Ok(IndexPlan {
        used,
        plan,
        order_by_consumed: false,
    })
}

/// Rehydrate a plan with the filter-time argument values.
///
/// A missing argument reads as NULL rather than failing; the engine never
/// supplies fewer values than the plan requested.
pub fn load_plan(plan: &str, args: &[Value]) -> Result<QueryConstraint> {
    let plan: ScanPlan =
        serde_json::from_str(plan).map_err(|e| PlugError::Protocol(e.to_string()))?;

    let arg_value = |slot: Option<usize>| -> Value {
        slot.and_then(|i| args.get(i)).cloned().unwrap_or(Value::Null)
    };

    let columns = plan
        .constraints
        .iter()
        .map(|entry| ColumnConstraint {
            column: entry.column,
            op: entry.op,
            value: entry
                .value
                .clone()
                .unwrap_or_else(|| arg_value(entry.arg)),
        })
        .collect();

    let as_count = |v: Value| -> Option<u64> {
        match v {
            Value::Int(n) if n >= 0 => Some(n as u64),
            _ => None,
        }
    };

    Ok(QueryConstraint {
        columns,
        order_by: plan.order_by,
        limit: as_count(arg_value(plan.limit_arg)).filter(|_| plan.limit_arg.is_some()),
        offset: as_count(arg_value(plan.offset_arg)).filter(|_| plan.offset_arg.is_some()),
    })
}

/// The constraint actually sent to the plugin.
///
/// LIKE patterns are rewritten to GLOB so plugins only ever see one
/// pattern syntax; the local re-filter keeps the original LIKE semantics,
/// so the rewrite can only over-approximate, never lose rows the engine
/// expects.
pub fn wire_constraint(constraint: &QueryConstraint) -> QueryConstraint {
    let mut wire = constraint.clone();
    for c in &mut wire.columns {
        if c.op == ConstraintOp::Like {
            c.op = ConstraintOp::Glob;
            if let Value::String(pattern) = &c.value {
                c.value = Value::String(like_to_glob(pattern));
            }
        }
    }
    wire
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugtab_common::{ColumnSpec, ColumnType};
    use pretty_assertions::assert_eq;

    use crate::vtab::IndexConstraint;

    fn descriptor() -> TableDescriptor {
        TableDescriptor::new(vec![
            ColumnSpec::new("account", ColumnType::String)
                .parameter()
                .required(),
            ColumnSpec::new("name", ColumnType::String),
            ColumnSpec::new("stars", ColumnType::Int),
        ])
    }

    fn usable(column: i32, op: RawOp) -> IndexConstraint {
        IndexConstraint {
            column,
            op,
            usable: true,
        }
    }

    #[test]
    fn plans_and_loads_round_trip() {
        let info = IndexInfo {
            constraints: vec![
                usable(0, RawOp::Eq),
                usable(2, RawOp::Gt),
                usable(1, RawOp::Like),
            ],
            order_by: vec![crate::vtab::IndexOrderBy {
                column: 2,
                descending: true,
            }],
        };
        let plan = plan_scan(&descriptor(), &info).unwrap();
        assert_eq!(plan.used, vec![Some(0), Some(1), Some(2)]);
        assert!(!plan.order_by_consumed);

        let constraint = load_plan(
            &plan.plan,
            &[
                Value::String("octocat".into()),
                Value::Int(100),
                Value::String("rust%".into()),
            ],
        )
        .unwrap();

        assert_eq!(constraint.columns.len(), 3);
        assert_eq!(constraint.value_for(0), Some(&Value::String("octocat".into())));
        assert_eq!(constraint.columns[1].op, ConstraintOp::Gt);
        assert_eq!(constraint.columns[2].op, ConstraintOp::Like);
        assert_eq!(
            constraint.order_by,
            vec![OrderConstraint {
                column: 2,
                descending: true
            }]
        );
    }

    #[test]
    fn missing_required_parameter_fails_preparation() {
        let info = IndexInfo {
            constraints: vec![usable(2, RawOp::Gt)],
            order_by: vec![],
        };
        let err = plan_scan(&descriptor(), &info).unwrap_err();
        assert!(matches!(err, PlugError::Constraint(_)));
    }

    #[test]
    fn unusable_equality_does_not_bind_a_required_parameter() {
        let info = IndexInfo {
            constraints: vec![IndexConstraint {
                column: 0,
                op: RawOp::Eq,
                usable: false,
            }],
            order_by: vec![],
        };
        assert!(plan_scan(&descriptor(), &info).is_err());
    }

    #[test]
    fn null_tests_become_fixed_values() {
        let mut descriptor = descriptor();
        descriptor.columns[0].is_required = false;

        let info = IndexInfo {
            constraints: vec![usable(1, RawOp::IsNull), usable(2, RawOp::IsNotNull)],
            order_by: vec![],
        };
        let plan = plan_scan(&descriptor, &info).unwrap();
        // Fixed values take no argument slots.
        assert_eq!(plan.used, vec![None, None]);

        let constraint = load_plan(&plan.plan, &[]).unwrap();
        assert_eq!(constraint.columns[0].op, ConstraintOp::Eq);
        assert_eq!(constraint.columns[0].value, Value::Null);
        assert_eq!(constraint.columns[1].op, ConstraintOp::Ne);
        assert_eq!(constraint.columns[1].value, Value::Null);
    }

    #[test]
    fn offset_only_consumed_when_handled() {
        let mut descriptor = descriptor();
        descriptor.columns[0].is_required = false;

        // Engines report the pseudo constraints with a negative column.
        let info = IndexInfo {
            constraints: vec![usable(-1, RawOp::Limit), usable(-1, RawOp::Offset)],
            order_by: vec![],
        };

        let plan = plan_scan(&descriptor, &info).unwrap();
        assert_eq!(plan.used, vec![Some(0), None]);
        let constraint = load_plan(&plan.plan, &[Value::Int(10)]).unwrap();
        assert_eq!(constraint.limit, Some(10));
        assert_eq!(constraint.offset, None);

        descriptor.handles_offset = true;
        let plan = plan_scan(&descriptor, &info).unwrap();
        assert_eq!(plan.used, vec![Some(0), Some(1)]);
        let constraint = load_plan(&plan.plan, &[Value::Int(10), Value::Int(5)]).unwrap();
        assert_eq!(constraint.limit, Some(10));
        assert_eq!(constraint.offset, Some(5));
    }

    #[test]
    fn like_is_rewritten_for_the_wire_only() {
        let constraint = QueryConstraint {
            columns: vec![ColumnConstraint {
                column: 1,
                op: ConstraintOp::Like,
                value: Value::String("rust_%".into()),
            }],
            ..Default::default()
        };
        let wire = wire_constraint(&constraint);
        assert_eq!(wire.columns[0].op, ConstraintOp::Glob);
        assert_eq!(wire.columns[0].value, Value::String("rust?*".into()));
        // The local copy keeps LIKE semantics for re-filtering.
        assert_eq!(constraint.columns[0].op, ConstraintOp::Like);
    }
}
