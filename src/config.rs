use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::execution::step::IntegrationStep;
use crate::logger::IntegrationLogger;
use crate::{IntegrationError, Result};

/// A provider integration instance: the unit a synchronization job is
/// initiated for, carrying the user's provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationInstance {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigFieldType {
    String,
    Boolean,
    Number,
}

/// Declaration of one instance config field. Masked fields are hidden when
/// the config is rendered for logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfigField {
    #[serde(rename = "type")]
    pub field_type: ConfigFieldType,
    #[serde(default)]
    pub mask: bool,
}

impl InstanceConfigField {
    pub fn of(field_type: ConfigFieldType) -> Self {
        Self {
            field_type,
            mask: false,
        }
    }

    pub fn masked(field_type: ConfigFieldType) -> Self {
        Self {
            field_type,
            mask: true,
        }
    }
}

/// Caller-supplied enable/disable decision for one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStartState {
    #[serde(default)]
    pub disabled: bool,
}

pub type StepStartStates = HashMap<String, StepStartState>;

/// Context handed to the invocation-level hooks.
#[derive(Clone)]
pub struct InvocationContext {
    pub instance: Arc<IntegrationInstance>,
    pub logger: IntegrationLogger,
}

pub type GetStepStartStatesFn = Arc<dyn Fn(&InvocationContext) -> StepStartStates + Send + Sync>;

pub type ValidateInvocationFn =
    Arc<dyn Fn(InvocationContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Everything an integration hands the framework for one invocation.
#[derive(Clone, Default)]
pub struct IntegrationInvocationConfig {
    pub instance_config_fields: HashMap<String, InstanceConfigField>,
    pub integration_steps: Vec<IntegrationStep>,
    pub get_step_start_states: Option<GetStepStartStatesFn>,
    pub validate_invocation: Option<ValidateInvocationFn>,
}

/// Checks declared fields against the instance config, coercing string
/// renditions of booleans and numbers. Returns the coerced config; undeclared
/// keys pass through untouched.
pub fn validate_instance_config(
    fields: &HashMap<String, InstanceConfigField>,
    config: &Map<String, Value>,
) -> Result<Map<String, Value>> {
    let mut coerced = config.clone();
    let mut problems = Vec::new();

    let mut names: Vec<&String> = fields.keys().collect();
    names.sort();
    for name in names {
        let field = &fields[name];
        match config.get(name.as_str()) {
            None | Some(Value::Null) => {
                problems.push(format!("config field \"{name}\" is required"));
            }
            Some(value) => match coerce(field.field_type, value) {
                Some(value) => {
                    coerced.insert(name.clone(), value);
                }
                None => {
                    problems.push(format!(
                        "config field \"{name}\" expected type {:?}",
                        field.field_type
                    ));
                }
            },
        }
    }

    if problems.is_empty() {
        Ok(coerced)
    } else {
        Err(IntegrationError::config_validation(problems.join("; ")))
    }
}

fn coerce(field_type: ConfigFieldType, value: &Value) -> Option<Value> {
    match (field_type, value) {
        (ConfigFieldType::String, Value::String(_)) => Some(value.clone()),
        (ConfigFieldType::String, Value::Bool(flag)) => Some(Value::String(flag.to_string())),
        (ConfigFieldType::String, Value::Number(number)) => {
            Some(Value::String(number.to_string()))
        }
        (ConfigFieldType::Boolean, Value::Bool(_)) => Some(value.clone()),
        (ConfigFieldType::Boolean, Value::String(text)) => {
            match text.to_ascii_lowercase().as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            }
        }
        (ConfigFieldType::Number, Value::Number(_)) => Some(value.clone()),
        (ConfigFieldType::Number, Value::String(text)) => text
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        _ => None,
    }
}

/// Instance config rendered for logs: masked fields are redacted.
pub fn masked_instance_config(
    fields: &HashMap<String, InstanceConfigField>,
    config: &Map<String, Value>,
) -> Map<String, Value> {
    let mut rendered = config.clone();
    for (name, field) in fields {
        if field.mask && rendered.contains_key(name.as_str()) {
            rendered.insert(name.clone(), Value::String("****".to_string()));
        }
    }
    rendered
}

/// Start states for every declared step, all enabled.
pub fn default_step_start_states(steps: &[IntegrationStep]) -> StepStartStates {
    steps
        .iter()
        .map(|step| (step.id.clone(), StepStartState::default()))
        .collect()
}

/// Start states must cover exactly the declared step set. Unknown ids are
/// reported before unaccounted ones.
pub fn validate_step_start_states(
    steps: &[IntegrationStep],
    states: &StepStartStates,
) -> Result<()> {
    let declared: std::collections::HashSet<&str> =
        steps.iter().map(|step| step.id.as_str()).collect();

    let mut invalid: Vec<String> = states
        .keys()
        .filter(|id| !declared.contains(id.as_str()))
        .cloned()
        .collect();
    if !invalid.is_empty() {
        invalid.sort();
        return Err(IntegrationError::StepStartStateInvalidStepId { step_ids: invalid });
    }

    let unaccounted: Vec<String> = steps
        .iter()
        .filter(|step| !states.contains_key(&step.id))
        .map(|step| step.id.clone())
        .collect();
    if !unaccounted.is_empty() {
        return Err(IntegrationError::UnaccountedStepStartStates {
            step_ids: unaccounted,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::step::tests::noop_step;
    use serde_json::json;

    #[test]
    fn missing_start_state_names_the_step() {
        let steps = vec![noop_step("a", &[]), noop_step("b", &[])];
        let mut states = StepStartStates::new();
        states.insert("a".to_string(), StepStartState { disabled: false });

        let err = validate_step_start_states(&steps, &states).unwrap_err();
        assert_eq!(err.code(), "UNACCOUNTED_STEP_START_STATES");
        assert!(err.to_string().contains('b'));
    }

    #[test]
    fn unknown_start_state_names_the_invalid_id_first() {
        let steps = vec![noop_step("a", &[]), noop_step("b", &[])];
        let mut states = StepStartStates::new();
        states.insert("a".to_string(), StepStartState::default());
        states.insert("c".to_string(), StepStartState::default());

        let err = validate_step_start_states(&steps, &states).unwrap_err();
        assert_eq!(err.code(), "STEP_START_STATE_INVALID_STEP_ID");
        assert!(err.to_string().contains('c'));
    }

    #[test]
    fn exact_cover_is_accepted() {
        let steps = vec![noop_step("a", &[])];
        let states = default_step_start_states(&steps);
        assert!(validate_step_start_states(&steps, &states).is_ok());
    }

    #[test]
    fn coerces_string_renditions_of_numbers_and_booleans() {
        let mut fields = HashMap::new();
        fields.insert(
            "apiKey".to_string(),
            InstanceConfigField::masked(ConfigFieldType::String),
        );
        fields.insert(
            "pageSize".to_string(),
            InstanceConfigField::of(ConfigFieldType::Number),
        );
        fields.insert(
            "includeArchived".to_string(),
            InstanceConfigField::of(ConfigFieldType::Boolean),
        );

        let mut config = Map::new();
        config.insert("apiKey".to_string(), json!("secret"));
        config.insert("pageSize".to_string(), json!("250"));
        config.insert("includeArchived".to_string(), json!("True"));
        config.insert("extra".to_string(), json!("kept"));

        let coerced = validate_instance_config(&fields, &config).unwrap();
        assert_eq!(coerced.get("pageSize"), Some(&json!(250.0)));
        assert_eq!(coerced.get("includeArchived"), Some(&json!(true)));
        assert_eq!(coerced.get("extra"), Some(&json!("kept")));
    }

    #[test]
    fn missing_and_mistyped_fields_fail_together() {
        let mut fields = HashMap::new();
        fields.insert(
            "apiKey".to_string(),
            InstanceConfigField::of(ConfigFieldType::String),
        );
        fields.insert(
            "pageSize".to_string(),
            InstanceConfigField::of(ConfigFieldType::Number),
        );

        let mut config = Map::new();
        config.insert("pageSize".to_string(), json!("not-a-number"));

        let err = validate_instance_config(&fields, &config).unwrap_err();
        assert_eq!(err.code(), "CONFIG_VALIDATION_ERROR");
        let message = err.to_string();
        assert!(message.contains("apiKey"));
        assert!(message.contains("pageSize"));
    }

    #[test]
    fn masked_fields_are_redacted_for_logs() {
        let mut fields = HashMap::new();
        fields.insert(
            "apiKey".to_string(),
            InstanceConfigField::masked(ConfigFieldType::String),
        );
        let mut config = Map::new();
        config.insert("apiKey".to_string(), json!("secret"));
        config.insert("region".to_string(), json!("us-east-1"));

        let rendered = masked_instance_config(&fields, &config);
        assert_eq!(rendered.get("apiKey"), Some(&json!("****")));
        assert_eq!(rendered.get("region"), Some(&json!("us-east-1")));
    }
}
