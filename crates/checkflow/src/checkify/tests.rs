//! Tests for instrumentation, the registry, message tables and policies.

use super::instrument::{reachable_codes, strip_checks};
use super::*;
use crate::array::Array;
use crate::ir::{Atom, Function, Primitive};

fn scalar(x: f64) -> Array {
    Array::scalar(x)
}

fn count_merges(func: &Function) -> usize {
    func.equations
        .iter()
        .map(|eq| {
            let own = usize::from(matches!(eq.primitive, Primitive::ErrorMerge { .. }));
            own + eq
                .primitive
                .subfunctions()
                .into_iter()
                .map(|sub| count_merges(sub))
                .sum::<usize>()
        })
        .sum()
}

// ============================================================================
// Message tables
// ============================================================================

#[test]
fn test_render_template_placeholders() {
    let args = vec!["1".to_string(), "2".to_string()];
    assert_eq!(schema::render_template("a {} b {}", &args), "a 1 b 2");
    assert_eq!(schema::render_template("{1} then {0}", &args), "2 then 1");
    assert_eq!(schema::render_template("{{literal}} {}", &args), "{literal} 1");
    assert_eq!(schema::render_template("missing {5}", &args), "missing {5}");
}

#[test]
fn test_schema_allocates_disjoint_ranges() {
    let mut schema = ErrorSchema::new();
    assert_eq!(
        schema.push(ErrorCategory::Div, "division by zero".into(), 0),
        (0, 0)
    );
    assert_eq!(
        schema.push(ErrorCategory::OutOfBounds, BOUNDS_TEMPLATE.into(), 4),
        (1, 0)
    );
    assert_eq!(
        schema.push(ErrorCategory::UserAssert, "x={}".into(), 1),
        (2, 4)
    );
    assert_eq!(schema.width(), 5);

    let mut outer = ErrorSchema::new();
    outer.push(ErrorCategory::Nan, "nan generated by primitive sin".into(), 0);
    let (base, offset) = outer.append(schema.slots());
    assert_eq!((base, offset), (1, 0));
    assert_eq!(outer.len(), 4);
    assert_eq!(outer.slot(3).unwrap().offset, 4);
    assert_eq!(outer.width(), 5);
}

#[test]
fn test_slot_render_reads_its_range() {
    let slot = MessageSlot {
        category: ErrorCategory::OutOfBounds,
        template: BOUNDS_TEMPLATE.to_string(),
        offset: 1,
        arity: 4,
    };
    let message = slot.render(&[99.0, 5.0, 5.0, 0.0, 3.0]);
    assert_eq!(
        message,
        "out-of-bounds indexing: index 5 is out of bounds for axis 0 with size 3"
    );
}

// ============================================================================
// Registry
// ============================================================================

#[test]
fn test_builtin_registry_order() {
    let registry = CheckRegistry::builtin();
    let names: Vec<&str> = registry.rules().iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["div", "nan", "oob", "user"]);
}

#[test]
fn test_applicable_respects_enabled_set() {
    let registry = CheckRegistry::builtin();
    let div = Primitive::Binary(crate::ir::BinaryOp::Div);
    let all: Vec<&str> = registry
        .applicable(&div, ErrorSet::ALL_CHECKS)
        .map(|r| r.name)
        .collect();
    assert_eq!(all, vec!["div", "nan"]);
    let nan_only: Vec<&str> = registry
        .applicable(&div, ErrorCategory::Nan.into())
        .map(|r| r.name)
        .collect();
    assert_eq!(nan_only, vec!["nan"]);
    assert_eq!(registry.applicable(&div, ErrorSet::INDEX_CHECKS).count(), 0);
}

#[test]
fn test_bounds_probe_on_unindexed_site_never_fires() {
    let registry = CheckRegistry::builtin();
    let bounds = registry
        .rules()
        .iter()
        .find(|r| r.name == "oob")
        .unwrap();
    let add = Primitive::Binary(crate::ir::BinaryOp::Add);
    let inputs = [Atom::scalar(1.0), Atom::scalar(2.0)];
    let outputs = [Atom::scalar(3.0)];
    let site = CheckSite {
        primitive: &add,
        inputs: &inputs,
        outputs: &outputs,
    };
    let mut b = crate::ir::FunctionBuilder::new();
    let probe = (bounds.probe)(&mut b, &site);
    assert_eq!(probe.predicate, Atom::from(false));
    assert!(probe.payload.is_empty());
}

#[test]
fn test_custom_rule_registration() {
    let mut registry = CheckRegistry::builtin();
    registry.register(CheckRule {
        category: ErrorCategory::Nan,
        name: "negative_sqrt",
        applies: |p| matches!(p, Primitive::Unary(crate::ir::UnaryOp::Sqrt)),
        template: |_| "sqrt of a negative value".to_string(),
        probe: |b, site| {
            let negative = b.lt(&site.inputs[0], 0.0);
            Probe {
                predicate: b.reduce_any(negative),
                payload: Vec::new(),
            }
        },
    });
    let f = Function::build(1, |b, p| vec![b.sqrt(&p[0])]);
    let config = CheckifyConfig::new(ErrorSet::FLOAT_CHECKS);
    let checked = checkify_with(&f, &config, &registry).unwrap();
    assert_eq!(
        checked.messages(),
        vec!["nan generated by primitive sqrt", "sqrt of a negative value"]
    );
    let (error, _) = checked.call(&[scalar(-4.0)]).unwrap();
    // the NaN rule is registered earlier and wins
    assert_eq!(error.get().as_deref(), Some("nan generated by primitive sqrt"));
}

// ============================================================================
// Instrumentation
// ============================================================================

#[test]
fn test_disabled_checks_bypass() {
    let f = Function::build(2, |b, p| vec![b.div(&p[0], &p[1])]);
    let checked = checkify(&f, ErrorSet::NONE).unwrap();
    assert_eq!(count_merges(checked.function()), 0);
    assert!(checked.messages().is_empty());
    let (error, outs) = checked.call(&[scalar(1.0), scalar(0.0)]).unwrap();
    assert!(error.get().is_none());
    assert_eq!(outs, vec![scalar(f64::INFINITY)]);
}

#[test]
fn test_one_merge_per_enabled_site() {
    let f = Function::build(2, |b, p| {
        let q = b.div(&p[0], &p[1]);
        vec![b.take(q, 0.0)]
    });
    let checked = checkify(&f, ErrorSet::ALL_CHECKS).unwrap();
    // div: division + nan, index: bounds
    assert_eq!(count_merges(checked.function()), 3);
    assert_eq!(checked.schema().width(), 4);
    assert_eq!(reachable_codes(checked.function()), vec![0, 1, 2]);
}

#[test]
fn test_comparisons_are_not_nan_sites() {
    let f = Function::build(2, |b, p| vec![b.lt(&p[0], &p[1])]);
    let checked = checkify(&f, ErrorSet::FLOAT_CHECKS).unwrap();
    assert!(checked.messages().is_empty());
}

#[test]
fn test_nan_input_does_not_fire() {
    let f = Function::build(1, |b, p| vec![b.add(&p[0], 1.0)]);
    let checked = checkify(&f, ErrorSet::FLOAT_CHECKS).unwrap();
    let (error, _) = checked.call(&[scalar(f64::NAN)]).unwrap();
    assert!(!error.is_triggered());
}

#[test]
fn test_strip_checks_removes_asserts_recursively() {
    let inner = Function::build(1, |b, p| {
        b.check(&p[0], "inner", Vec::new());
        vec![p[0].clone()]
    });
    let f = Function::build(1, |b, p| {
        b.check(&p[0], "outer", Vec::new());
        b.call(inner, p.to_vec())
    });
    let stripped = strip_checks(&f);
    assert_eq!(stripped.equations.len(), 1);
    match &stripped.equations[0].primitive {
        Primitive::Call { body, .. } => assert!(body.equations.is_empty()),
        other => panic!("expected call, got {}", other.name()),
    }
}

#[test]
fn test_invalid_function_is_rejected() {
    let f = Function {
        params: Vec::new(),
        equations: Vec::new(),
        results: vec![crate::ir::Atom::Var(crate::ir::Var(0))],
        var_count: 1,
    };
    let err = checkify(&f, ErrorSet::ALL_CHECKS).unwrap_err();
    assert!(matches!(err, CheckifyError::Invalid(_)));
}

#[test]
fn test_error_code_and_category() {
    let f = Function::build(1, |b, p| {
        let s = b.sin(&p[0]);
        let t = b.take(Array::from_vec(vec![1.0, 2.0]), 5.0);
        vec![s, t]
    });
    let checked = checkify(&f, ErrorSet::AUTOMATIC_CHECKS).unwrap();
    let (error, _) = checked.call(&[scalar(f64::INFINITY)]).unwrap();
    assert_eq!(error.code(), Some(0));
    assert_eq!(error.category(), Some(ErrorCategory::Nan));
    let (error, _) = checked.call(&[scalar(1.0)]).unwrap();
    assert_eq!(error.code(), Some(1));
    assert_eq!(error.category(), Some(ErrorCategory::OutOfBounds));
}

// ============================================================================
// Policies
// ============================================================================

#[test]
fn test_policy_from_yaml() {
    let yaml = r#"
apiVersion: checkflow/v1
kind: CheckPolicy

metadata:
  name: strict
  labels:
    team: numerics

errors: automatic_checks
whileInMap: masked
replicaErrors: reduce
"#;
    let config = CheckifyConfig::from_yaml(yaml).unwrap();
    assert_eq!(config.metadata.name, "strict");
    assert_eq!(config.metadata.labels.get("team").map(String::as_str), Some("numerics"));
    assert_eq!(config.errors, ErrorSet::AUTOMATIC_CHECKS);
    assert_eq!(config.while_in_map, WhileInMap::Masked);
    assert_eq!(config.replica_errors, Some(ReplicaErrors::Reduce));
}

#[test]
fn test_policy_category_list() {
    let yaml = r#"
apiVersion: checkflow/v1
kind: CheckPolicy
errors: [div, oob]
"#;
    let config = CheckifyConfig::from_yaml(yaml).unwrap();
    assert!(config.errors.contains(ErrorCategory::Div));
    assert!(config.errors.contains(ErrorCategory::OutOfBounds));
    assert!(!config.errors.contains(ErrorCategory::Nan));
    assert_eq!(config.while_in_map, WhileInMap::Reject);
    assert_eq!(config.replica_errors, None);
}

#[test]
fn test_policy_defaults() {
    let config = CheckifyConfig::from_yaml("{}").unwrap();
    assert_eq!(config, CheckifyConfig::default());
    assert_eq!(config.errors, ErrorSet::USER_CHECKS);
}

#[test]
fn test_policy_rejects_unknown_set() {
    let yaml = "errors: everything\n";
    assert!(matches!(
        CheckifyConfig::from_yaml(yaml),
        Err(ConfigError::Yaml(_))
    ));
}

#[test]
fn test_policy_rejects_wrong_version() {
    let yaml = "apiVersion: checkflow/v2\n";
    assert!(matches!(
        CheckifyConfig::from_yaml(yaml),
        Err(ConfigError::UnsupportedVersion(v)) if v == "checkflow/v2"
    ));
}

#[test]
fn test_policy_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("policy.yaml");
    std::fs::write(&path, "kind: CheckPolicy\nerrors: float_checks\n").unwrap();
    let config = CheckifyConfig::load(&path).unwrap();
    assert_eq!(config.errors, ErrorSet::FLOAT_CHECKS);
}

#[test]
fn test_policy_yaml_roundtrip_keeps_named_set() {
    let config = CheckifyConfig::new(ErrorSet::INDEX_CHECKS).with_while_in_map(WhileInMap::Masked);
    let yaml = config.to_yaml().unwrap();
    assert!(yaml.contains("errors: index_checks"));
    assert_eq!(CheckifyConfig::from_yaml(&yaml).unwrap(), config);
}
