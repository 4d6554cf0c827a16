//! End-to-end scenarios over small hexagonal meshes.

use hexrd::operators::{self, Coefficients};
use hexrd::prelude::*;

fn close(x: Real, y: Real, tol: Real) -> bool {
    (x - y).abs() <= tol * (1.0 + x.abs().max(y.abs()))
}

/// Two identical populations seeded at mirrored positions, steered by a
/// linear field with opposite signs.
fn mirrored_pair(competition: Competition) -> Simulation {
    let mesh = HexMesh::hexagon(8, 0.02).unwrap();
    let params = ModelParams::default()
        .with_dt(1e-4)
        .with_noise(0.0, 1.0)
        .with_competition(competition);

    let mut setup = Simulation::allocate(mesh, 2, 1, params).unwrap();
    setup
        .set_guidance(0, GuidanceChannel::new(FieldShape::Linear1D).with_width(1.0))
        .unwrap();
    for (i, x, gamma) in [(0, -0.05, 1.0), (1, 0.05, -1.0)] {
        setup
            .set_population(
                i,
                Population::new(format!("p{i}"))
                    .with_growth(3.0, 20.0)
                    .with_epsilon(0.5)
                    .with_init(InitialMask::gaussian(1.0, 0.05, x, 0.0)),
            )
            .unwrap();
        setup.set_gamma(i, 0, gamma).unwrap();
    }
    setup.init().unwrap()
}

/// The same pair with no guidance at all: only the seeding breaks the symmetry.
fn unguided_pair(competition: Competition) -> Simulation {
    let mesh = HexMesh::hexagon(8, 0.02).unwrap();
    let params = ModelParams::default()
        .with_dt(1e-4)
        .with_noise(0.0, 1.0)
        .with_competition(competition);

    let mut setup = Simulation::allocate(mesh, 2, 0, params).unwrap();
    for (i, x) in [(0, -0.05), (1, 0.05)] {
        setup
            .set_population(
                i,
                Population::new(format!("p{i}"))
                    .with_growth(3.0, 20.0)
                    .with_epsilon(0.5)
                    .with_init(InitialMask::gaussian(1.0, 0.05, x, 0.0)),
            )
            .unwrap();
    }
    setup.init().unwrap()
}

fn assert_mirrored(sim: &Simulation) {
    let mesh = sim.mesh();
    let (a0, a1) = (sim.a(0).unwrap(), sim.a(1).unwrap());
    let (c0, c1) = (sim.c(0).unwrap(), sim.c(1).unwrap());
    for h in 0..mesh.len() {
        let (x, y) = mesh.position(h);
        let m = mesh.nearest(-x, y);
        assert!(close(a0[h], a1[m], 1e-9), "a at {h}: {} vs {}", a0[h], a1[m]);
        assert!(close(c0[h], c1[m], 1e-9), "c at {h}: {} vs {}", c0[h], c1[m]);
    }
    assert!(close(sim.budget().sum_a[0], sim.budget().sum_a[1], 1e-9));
}

#[test]
fn unguided_mirrored_populations_stay_mirrored() {
    let mut sim = unguided_pair(Competition::PowerLaw { l: 3.0 });
    sim.run(100).unwrap();
    assert_eq!(sim.channel_count(), 0);
    assert!(sim.budget().sum_c[0] > 0.0);
    assert_mirrored(&sim);
}

#[test]
fn mirrored_populations_stay_mirrored() {
    let mut sim = mirrored_pair(Competition::PowerLaw { l: 3.0 });
    sim.run(100).unwrap();
    assert_mirrored(&sim);
}

#[test]
fn densities_stay_in_range() {
    for competition in [
        Competition::PowerLaw { l: 3.0 },
        Competition::Logistic { l: 1.0, m: 1e-8 },
        Competition::sigmoid_rolloff(1.0),
    ] {
        let mut sim = mirrored_pair(competition);
        for _ in 0..50 {
            sim.step().unwrap();
            for i in 0..sim.population_count() {
                assert!(sim.a(i).unwrap().iter().all(|&v| v >= 0.0), "{competition:?}");
                assert!(
                    sim.c(i).unwrap().iter().all(|&v| (0.0..=1.0).contains(&v)),
                    "{competition:?}"
                );
            }
        }
    }
}

#[test]
fn coupling_field_comes_from_connections_before_the_step() {
    let mut sim = mirrored_pair(Competition::PowerLaw { l: 3.0 });
    sim.run(20).unwrap();

    let before: Vec<Vec<Real>> = (0..2).map(|i| sim.c(i).unwrap().to_vec()).collect();
    sim.step().unwrap();

    for (h, &n) in sim.n().iter().enumerate() {
        let expected = (1.0 - before[0][h] - before[1][h]).clamp(0.0, 1.0);
        assert!((n - expected).abs() < 1e-15, "cell {h}");
    }
}

#[test]
fn uniform_field_has_zero_laplacian_everywhere() {
    let mesh = HexMesh::hexagon(4, 0.1).unwrap();
    let f = vec![0.7; mesh.len()];
    let mut out = vec![1.0; mesh.len()];
    operators::laplacian(&mesh, ExecutionTier::Scalar, &f, 3.0, &mut out);
    assert!(out.iter().all(|&v| v == 0.0));

    let k = Coefficients::new(mesh.spacing(), 0.0).first_order;
    let mut grad = VectorField::zeros(mesh.len());
    operators::gradient(&mesh, ExecutionTier::Scalar, &f, k, &mut grad);
    assert!(grad.x.iter().chain(&grad.y).all(|&v| v == 0.0));
}

#[test]
fn subtraction_transfer_hits_its_budget() {
    let mesh = HexMesh::hexagon(5, 0.05).unwrap();
    let params = ModelParams::default()
        .with_dt(1e-3)
        .with_noise(0.1, 0.5)
        .with_transfer(Transfer::DivisiveSubtractConnections)
        .with_seed(9);
    let mut setup = Simulation::allocate(mesh, 2, 0, params).unwrap();
    for i in 0..2 {
        setup
            .set_population(i, Population::new(format!("p{i}")).with_growth(1.0, 5.0))
            .unwrap();
    }
    let mut sim = setup.init().unwrap();

    for _ in 0..10 {
        sim.step().unwrap();
        let budget = sim.budget();
        for i in 0..2 {
            let total: Real = sim.a(i).unwrap().iter().sum();
            let target = budget.sum_a_init[i] - budget.sum_c[i];
            assert!(target > 0.0);
            assert!(close(total, target, 1e-9), "{total} vs {target}");
        }
        assert_eq!(sim.diagnostics().clamped_branching, 0);
    }
    assert!(sim.budget().sum_c[0] > 0.0);
}

#[test]
fn linear_guidance_matches_its_closed_form() {
    let mesh = HexMesh::hexagon(4, 0.05).unwrap();
    let mut setup = Simulation::allocate(mesh, 1, 1, ModelParams::default()).unwrap();
    let channel = GuidanceChannel::new(FieldShape::Linear1D)
        .with_gain(2.0)
        .with_phi(0.3)
        .with_width(0.5)
        .with_offset(0.1);
    setup.set_guidance(0, channel).unwrap();
    let sim = setup.init().unwrap();

    let (s, c) = 0.3f64.sin_cos();
    let rho = sim.rho(0).unwrap();
    let grad = sim.grad_rho(0).unwrap();
    for (h, cell) in sim.mesh().cells().iter().enumerate() {
        let expected = 2.0 * (cell.x * c + cell.y * s - 0.1) / 0.5;
        assert!((rho[h] - expected).abs() < 1e-12);
        assert!((grad.x[h] - 4.0 * c).abs() < 1e-12);
        assert!((grad.y[h] - 4.0 * s).abs() < 1e-12);
    }
}

#[test]
fn guidance_is_silent_before_onset() {
    let build = |gamma: Real| {
        let mesh = HexMesh::hexagon(4, 0.05).unwrap();
        let params = ModelParams::default().with_dt(1e-4).with_seed(21);
        let mut setup = Simulation::allocate(mesh, 1, 1, params).unwrap();
        setup
            .set_guidance(
                0,
                GuidanceChannel::new(FieldShape::Gauss2D)
                    .with_width(0.1)
                    .with_onset(5),
            )
            .unwrap();
        setup.set_gamma(0, 0, gamma).unwrap();
        setup.init().unwrap()
    };
    let mut guided = build(2.0);
    let mut plain = build(0.0);

    for step in 1..=4 {
        guided.step().unwrap();
        plain.step().unwrap();
        assert!(!guided.guidance_active(0).unwrap());
        assert_eq!(guided.div_j(0).unwrap(), plain.div_j(0).unwrap(), "step {step}");
        assert_eq!(guided.a(0).unwrap(), plain.a(0).unwrap(), "step {step}");
    }

    guided.step().unwrap();
    plain.step().unwrap();
    assert!(guided.guidance_active(0).unwrap());
    assert_ne!(guided.div_j(0).unwrap(), plain.div_j(0).unwrap());
}

#[test]
fn out_of_range_indices_are_errors() {
    let mesh = HexMesh::hexagon(2, 0.1).unwrap();
    let mut setup = Simulation::allocate(mesh, 2, 1, ModelParams::default()).unwrap();
    assert!(matches!(
        setup.set_gamma(0, 1, 1.0),
        Err(SimError::IndexOutOfRange { limit: 1, .. })
    ));
    assert!(setup.set_guidance(3, GuidanceChannel::default()).is_err());

    let sim = setup.init().unwrap();
    assert!(sim.gamma(2, 0).is_err());
    assert!(sim.a(2).is_err());
    assert!(sim.rho(1).is_err());
}

#[test]
fn execution_tiers_agree() {
    let build = |tier: ExecutionTier| {
        let mesh = HexMesh::hexagon(10, 0.02).unwrap();
        let params = ModelParams::default()
            .with_dt(1e-4)
            .with_competition(Competition::PowerLaw { l: 2.0 })
            .with_transfer(Transfer::DivisiveInitialSum)
            .with_execution_tier(tier)
            .with_seed(4);
        let mut setup = Simulation::allocate(mesh, 3, 0, params).unwrap();
        for i in 0..3 {
            let p = setup.population_mut(i).unwrap();
            p.alpha = 2.0;
            p.beta = 8.0;
            p.epsilon = 0.3;
        }
        let mut sim = setup.init().unwrap();
        sim.run(20).unwrap();
        sim
    };
    let scalar = build(ExecutionTier::Scalar);
    let parallel = build(ExecutionTier::Parallel);
    for i in 0..3 {
        for (x, y) in scalar.a(i).unwrap().iter().zip(parallel.a(i).unwrap()) {
            assert!((x - y).abs() < 1e-12);
        }
    }
}

#[test]
fn dual_regions_trade_a_shared_budget() {
    let region = |rings: u32, phi: Real| {
        let mesh = HexMesh::hexagon(rings, 0.05).unwrap();
        let params = ModelParams::default()
            .with_dt(1e-3)
            .with_transfer(Transfer::DivisiveInitialSum)
            .with_seed(rings as u64);
        let mut setup = Simulation::allocate(mesh, 2, 1, params).unwrap();
        setup
            .set_guidance(
                0,
                GuidanceChannel::new(FieldShape::Linear1D)
                    .with_phi(phi)
                    .with_width(1.0),
            )
            .unwrap();
        setup.set_gamma(0, 0, 1.0).unwrap();
        setup.set_gamma(1, 0, -1.0).unwrap();
        for i in 0..2 {
            setup.population_mut(i).unwrap().beta = 2.0;
        }
        setup.init().unwrap()
    };

    let mut pooled = DualRegion::new(region(3, 0.0), region(4, 1.0))
        .unwrap()
        .with_budget(DualBudget::Pooled)
        .unwrap();
    let initial = pooled.budgets().0.sum_a_init.clone();
    pooled.run(15).unwrap();

    assert_eq!(pooled.left().step_count(), 15);
    assert_eq!(pooled.right().step_count(), 15);
    for i in 0..2 {
        let left: Real = pooled.left().a(i).unwrap().iter().sum();
        let right: Real = pooled.right().a(i).unwrap().iter().sum();
        assert!(close(left + right, initial[i], 1e-9));
    }

    // Shared branching: each region's sum is its own initial sum times its
    // share of the branching summed over both regions.
    let mut shared = DualRegion::new(region(3, 0.0), region(4, 1.0)).unwrap();
    shared.run(15).unwrap();
    let (lb, rb) = shared.budgets();
    for i in 0..2 {
        let left: Real = shared.left().a(i).unwrap().iter().sum();
        let right: Real = shared.right().a(i).unwrap().iter().sum();
        let share_l = shared.left().budget().sum_a[i] / lb.sum_a[i];
        let share_r = shared.right().budget().sum_a[i] / rb.sum_a[i];
        assert!(close(share_l + share_r, 1.0, 1e-12));
        assert!(close(left, lb.sum_a_init[i] * share_l, 1e-9));
        assert!(close(right, rb.sum_a_init[i] * share_r, 1e-9));
    }
}

#[cfg(feature = "serde")]
#[test]
fn snapshot_serializes_to_json() {
    let sim = mirrored_pair(Competition::None);
    let snap = SimulationAdapter::new(&sim).snapshot();
    let json = serde_json::to_string(&snap).unwrap();
    let back: FieldSnapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(back.populations.len(), 2);
    assert_eq!(back.n.len(), sim.mesh().len());
}
