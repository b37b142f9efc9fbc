//! Scenario and parameter validation.
//!
//! Structural network validation (dangling endpoints, slack, impedances,
//! connectivity) lives in [`crate::network::NetworkModel::compile`]; this
//! module checks everything else the solve needs before any LP is built,
//! always naming the offending entity.

use crate::network::NetworkModel;
use crate::problem::PlanningProblem;
use cep_core::{CepError, CepResult};

/// Validate scenarios and system parameters against a compiled model.
pub fn validate_problem(problem: &PlanningProblem, model: &NetworkModel) -> CepResult<()> {
    if problem.scenarios.is_empty() {
        return Err(CepError::InvalidInput("no scenarios supplied".into()));
    }

    for scenario in &problem.scenarios {
        let name = &scenario.name;
        if scenario.horizon == 0 {
            return Err(CepError::InvalidInput(format!(
                "scenario '{name}' has non-positive horizon"
            )));
        }
        if !(scenario.weight > 0.0) {
            return Err(CepError::InvalidInput(format!(
                "scenario '{name}' has non-positive weight {}",
                scenario.weight
            )));
        }

        let check_matrix = |label: &str, matrix: &Vec<Vec<f64>>, cols: usize| -> CepResult<()> {
            if matrix.len() != scenario.horizon {
                return Err(CepError::InvalidInput(format!(
                    "scenario '{name}': {label} has {} rows, expected horizon {}",
                    matrix.len(),
                    scenario.horizon
                )));
            }
            for (t, row) in matrix.iter().enumerate() {
                if row.len() != cols {
                    return Err(CepError::InvalidInput(format!(
                        "scenario '{name}': {label} row {t} has {} entries, expected {cols}",
                        row.len()
                    )));
                }
            }
            Ok(())
        };
        check_matrix("cost matrix", &scenario.cost, model.n_gens())?;
        check_matrix("availability matrix", &scenario.availability, model.n_gens())?;
        check_matrix("demand matrix", &scenario.demand, model.n_loads())?;

        for (t, row) in scenario.availability.iter().enumerate() {
            for (g, &a) in row.iter().enumerate() {
                if !(0.0..=1.0).contains(&a) {
                    return Err(CepError::InvalidInput(format!(
                        "scenario '{name}': availability[{t}][{g}] = {a} for generator '{}' \
                         is outside [0, 1]",
                        model.gen_names[g]
                    )));
                }
            }
        }

        if scenario.shed_penalty < 0.0 || scenario.violation_penalty < 0.0 {
            return Err(CepError::InvalidInput(format!(
                "scenario '{name}' has a negative penalty"
            )));
        }
    }

    if problem.reserve_margin < 0.0 {
        return Err(CepError::InvalidInput(format!(
            "reserve margin {} is negative",
            problem.reserve_margin
        )));
    }
    if !(problem.contingency_rating > 0.0) {
        return Err(CepError::InvalidInput(format!(
            "post-contingency rating multiplier {} must be positive",
            problem.contingency_rating
        )));
    }
    if problem.emissions_cap < 0.0 {
        return Err(CepError::InvalidInput(format!(
            "total emissions cap {} is negative",
            problem.emissions_cap
        )));
    }
    if let Some(caps) = &problem.emissions_cap_per_scenario {
        if caps.len() != problem.scenarios.len() {
            return Err(CepError::InvalidInput(format!(
                "{} per-scenario emissions caps for {} scenarios",
                caps.len(),
                problem.scenarios.len()
            )));
        }
        if let Some(bad) = caps.iter().position(|&cap| cap < 0.0) {
            return Err(CepError::InvalidInput(format!(
                "emissions cap for scenario '{}' is negative",
                problem.scenarios[bad].name
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::{PlanningProblemBuilder, ScenarioData};
    use cep_core::{
        Branch, BranchId, Bus, BusId, Edge, Gen, GenId, Kilovolts, Load, LoadId, Megawatts,
        Network, Node, PerUnit,
    };

    fn network() -> Network {
        let mut network = Network::new();
        let b0 = network.graph.add_node(Node::Bus(Bus {
            id: BusId::new(0),
            name: "a".to_string(),
            base_kv: Kilovolts(230.0),
            slack: true,
            ..Bus::default()
        }));
        let b1 = network.graph.add_node(Node::Bus(Bus {
            id: BusId::new(1),
            name: "b".to_string(),
            base_kv: Kilovolts(230.0),
            ..Bus::default()
        }));
        network.graph.add_edge(
            b0,
            b1,
            Edge::Branch(Branch::new(
                BranchId::new(0),
                "a_b".to_string(),
                BusId::new(0),
                BusId::new(1),
                Megawatts(100.0),
                PerUnit(0.1),
            )),
        );
        network.graph.add_node(Node::Gen(
            Gen::new(GenId::new(0), "g".to_string(), BusId::new(0))
                .with_existing(Megawatts(80.0)),
        ));
        network.graph.add_node(Node::Load(Load {
            id: LoadId::new(0),
            name: "l".to_string(),
            bus: BusId::new(1),
        }));
        network
    }

    fn scenario(horizon: usize) -> ScenarioData {
        ScenarioData {
            name: "base".to_string(),
            weight: 1.0,
            horizon,
            cost: vec![vec![10.0]; horizon],
            availability: vec![vec![1.0]; horizon],
            demand: vec![vec![40.0]; horizon],
            shed_penalty: 1e4,
            violation_penalty: 2e3,
        }
    }

    #[test]
    fn test_valid_problem_passes() {
        let problem = PlanningProblemBuilder::new(network())
            .scenario(scenario(4))
            .build();
        let model = NetworkModel::compile(&problem.network).unwrap();
        assert!(validate_problem(&problem, &model).is_ok());
    }

    #[test]
    fn test_zero_horizon_rejected() {
        let problem = PlanningProblemBuilder::new(network())
            .scenario(scenario(0))
            .build();
        let model = NetworkModel::compile(&problem.network).unwrap();
        let err = validate_problem(&problem, &model).unwrap_err();
        assert!(err.to_string().contains("horizon"));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut bad = scenario(4);
        bad.demand = vec![vec![40.0, 1.0]; 4]; // two loads claimed, one exists
        let problem = PlanningProblemBuilder::new(network()).scenario(bad).build();
        let model = NetworkModel::compile(&problem.network).unwrap();
        let err = validate_problem(&problem, &model).unwrap_err();
        assert!(err.to_string().contains("demand matrix"));
    }

    #[test]
    fn test_availability_out_of_range_rejected() {
        let mut bad = scenario(2);
        bad.availability[1][0] = 1.2;
        let problem = PlanningProblemBuilder::new(network()).scenario(bad).build();
        let model = NetworkModel::compile(&problem.network).unwrap();
        let err = validate_problem(&problem, &model).unwrap_err();
        assert!(err.to_string().contains("availability"));
        assert!(err.to_string().contains("'g'"));
    }

    #[test]
    fn test_no_scenarios_rejected() {
        let problem = PlanningProblemBuilder::new(network()).build();
        let model = NetworkModel::compile(&problem.network).unwrap();
        assert!(validate_problem(&problem, &model).is_err());
    }
}
