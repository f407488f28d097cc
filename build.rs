use esp_config::{generate_config, ConfigOption, DisplayHint, Stability, Validator, Value};

fn main() {
    generate_config(
        "foa_rc",
        &[
            ConfigOption {
                name: String::from("max_peers"),
                description: String::from("Amount of peers, for which rate control state can be held. Must be a power of two."),
                default_value: Value::Integer(8),
                constraint: Some(Validator::PositiveInteger),
                stability: Stability::Stable(String::from("0.1.0")),
                active: true,
                display_hint: DisplayHint::None,
            },
            ConfigOption {
                name: String::from("max_vifs"),
                description: String::from("Amount of virtual interfaces, that rate control is run for"),
                default_value: Value::Integer(2),
                constraint: Some(Validator::PositiveInteger),
                stability: Stability::Stable(String::from("0.1.0")),
                active: true,
                display_hint: DisplayHint::None,
            },
            ConfigOption {
                name: String::from("ewma_level"),
                description: String::from("Weight of the previous success probability in percent"),
                default_value: Value::Integer(75),
                constraint: Some(Validator::IntegerInRange(0..100)),
                stability: Stability::Stable(String::from("0.1.0")),
                active: true,
                display_hint: DisplayHint::None,
            },
            ConfigOption {
                name: String::from("update_interval_ms"),
                description: String::from("Interval at which the statistics of a peer are rolled over"),
                default_value: Value::Integer(100),
                constraint: Some(Validator::PositiveInteger),
                stability: Stability::Stable(String::from("0.1.0")),
                active: true,
                display_hint: DisplayHint::None,
            },
            ConfigOption {
                name: String::from("probe_interval_ms"),
                description: String::from("Minimum interval between two probe frames to the same peer"),
                default_value: Value::Integer(200),
                constraint: Some(Validator::PositiveInteger),
                stability: Stability::Stable(String::from("0.1.0")),
                active: true,
                display_hint: DisplayHint::None,
            },
            ConfigOption {
                name: String::from("promotion_threshold"),
                description: String::from("Consecutive successes at the current rate, before moving to a faster one"),
                default_value: Value::Integer(3),
                constraint: Some(Validator::IntegerInRange(1..16)),
                stability: Stability::Stable(String::from("0.1.0")),
                active: true,
                display_hint: DisplayHint::None,
            },
            ConfigOption {
                name: String::from("demotion_threshold"),
                description: String::from("Consecutive failures at the current rate, before falling back to a more robust one"),
                default_value: Value::Integer(2),
                constraint: Some(Validator::IntegerInRange(1..16)),
                stability: Stability::Stable(String::from("0.1.0")),
                active: true,
                display_hint: DisplayHint::None,
            },
        ],
        false,
        true,
    );
}
