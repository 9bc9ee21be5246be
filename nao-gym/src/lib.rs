use anyhow::Result;
use nao_core::{
    env::{
        BoxedEnv, BoxedExpertEnv, Env, EnvOptions, EnvironmentDescription, ExpertEnv, SnapShot,
        Space,
    },
    env_registry::EnvRegistry,
    tensor::Buffer,
};
use pyo3::{
    Bound, PyAny, PyObject, PyResult, Python,
    exceptions::PyTypeError,
    types::{PyAnyMethods, PyDict, PyTuple},
};

/// Python package that provides the simulated robot.
pub const NAO_PACKAGE: &str = "envs";
pub const NAO_ENV: &str = "NaoEnv";
pub const NAO_ENV_PRETRAINED: &str = "NaoEnvPretrained";
/// Registry ids starting with this prefix are built with `gymnasium.make`.
pub const GYM_PREFIX: &str = "gym:";

/// `numpy.asarray(x, dtype=float32).ravel()` as a vector.
fn flatten(py: Python<'_>, value: &Bound<'_, PyAny>) -> PyResult<Vec<f32>> {
    let numpy = py.import("numpy")?;
    let kwargs = PyDict::new(py);
    kwargs.set_item("dtype", "float32")?;
    numpy
        .getattr("asarray")?
        .call((value,), Some(&kwargs))?
        .call_method0("ravel")?
        .call_method0("tolist")?
        .extract()
}

fn read_space(py: Python<'_>, space: &Bound<'_, PyAny>) -> PyResult<Space> {
    if space.hasattr("n")? && !space.hasattr("low")? {
        return Ok(Space::Discrete(space.getattr("n")?.extract()?));
    }
    let shape: Vec<usize> = space.getattr("shape")?.extract()?;
    if space.hasattr("low")? && space.hasattr("high")? {
        let low = flatten(py, &space.getattr("low")?)?;
        let high = flatten(py, &space.getattr("high")?)?;
        if low.iter().chain(high.iter()).all(|v| v.is_finite()) {
            return Ok(Space::bounded(low, high));
        }
    }
    Ok(Space::continuous_from_dims(shape))
}

/// A Python environment object driven through the gym protocol. Both the old `(obs, reward,
/// done, info)` and the newer five element step results are understood.
pub struct GymEnv {
    env: PyObject,
    action_space: Space,
    observation_space: Space,
    closed: bool,
}

impl GymEnv {
    fn from_object(py: Python<'_>, env: Bound<'_, PyAny>) -> PyResult<Self> {
        let action_space = read_space(py, &env.getattr("action_space")?)?;
        let observation_space = read_space(py, &env.getattr("observation_space")?)?;
        Ok(Self {
            env: env.unbind(),
            action_space,
            observation_space,
            closed: false,
        })
    }

    /// Instantiates `envs.<class>(gui=...)`.
    pub fn nao(class: &str, gui: bool) -> Result<Self> {
        let env = Python::with_gil(|py| {
            let package = py.import(NAO_PACKAGE)?;
            let kwargs = PyDict::new(py);
            kwargs.set_item("gui", gui)?;
            let env = package.getattr(class)?.call((), Some(&kwargs))?;
            Self::from_object(py, env)
        })?;
        tracing::debug!(class, gui, "nao environment created");
        Ok(env)
    }

    pub fn make(name: &str, render_mode: Option<&str>) -> Result<Self> {
        let env = Python::with_gil(|py| {
            let gym = py.import("gymnasium")?;
            let kwargs = PyDict::new(py);
            if let Some(render_mode) = render_mode {
                kwargs.set_item("render_mode", render_mode)?;
            }
            let env = gym.getattr("make")?.call((name,), Some(&kwargs))?;
            Self::from_object(py, env)
        })?;
        tracing::debug!(name, "gymnasium environment created");
        Ok(env)
    }

    fn object(&self) -> &PyObject {
        &self.env
    }
}

impl Env for GymEnv {
    fn reset(&mut self, seed: u64) -> Result<Buffer> {
        let state = Python::with_gil(|py| {
            let env = self.env.bind(py);
            let kwargs = PyDict::new(py);
            kwargs.set_item("seed", seed)?;
            let reset = match env.call_method("reset", (), Some(&kwargs)) {
                Ok(reset) => reset,
                // pre 0.26 gym environments are seeded separately
                Err(err) if err.is_instance_of::<PyTypeError>(py) => {
                    env.call_method1("seed", (seed,))?;
                    env.call_method0("reset")?
                }
                Err(err) => return Err(err),
            };
            if reset.is_instance_of::<PyTuple>() && reset.len()? == 2 {
                flatten(py, &reset.get_item(0)?)
            } else {
                flatten(py, &reset)
            }
        })?;
        Ok(Buffer::from_vec(state))
    }

    fn step(&mut self, action: Buffer) -> Result<SnapShot> {
        let snapshot = Python::with_gil(|py| {
            let env = self.env.bind(py);
            let step = match &self.action_space {
                Space::Discrete(_) => {
                    let idx = action
                        .data
                        .iter()
                        .enumerate()
                        .max_by(|a, b| a.1.total_cmp(b.1))
                        .map(|(idx, _)| idx)
                        .unwrap_or(0);
                    env.call_method1("step", (idx,))?
                }
                space => {
                    let action = match space.bounds() {
                        Some((min, max)) => action.clamp(min, max),
                        None => action,
                    };
                    env.call_method1("step", (action.to_data(),))?
                }
            };
            let state = flatten(py, &step.get_item(0)?)?;
            let reward: f32 = step.get_item(1)?.extract()?;
            let (terminated, truncated) = if step.len()? == 5 {
                (step.get_item(2)?.extract()?, step.get_item(3)?.extract()?)
            } else {
                let done: bool = step.get_item(2)?.extract()?;
                let info = step.get_item(3)?;
                let truncated: bool = info
                    .call_method1("get", ("TimeLimit.truncated", false))?
                    .extract()?;
                (done && !truncated, truncated)
            };
            PyResult::Ok(SnapShot {
                state: Buffer::from_vec(state),
                reward,
                terminated,
                truncated,
            })
        })?;
        Ok(snapshot)
    }

    fn env_description(&self) -> EnvironmentDescription {
        EnvironmentDescription::new(self.observation_space.clone(), self.action_space.clone())
    }

    fn render(&mut self) -> Result<()> {
        Python::with_gil(|py| self.env.call_method0(py, "render"))?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        Python::with_gil(|py| self.env.call_method0(py, "close"))?;
        Ok(())
    }
}

/// `NaoEnvPretrained`: the walking environment together with its scripted gait.
pub struct NaoExpertEnv(GymEnv);

impl NaoExpertEnv {
    pub fn new(gui: bool) -> Result<Self> {
        Ok(Self(GymEnv::nao(NAO_ENV_PRETRAINED, gui)?))
    }
}

impl Env for NaoExpertEnv {
    fn reset(&mut self, seed: u64) -> Result<Buffer> {
        self.0.reset(seed)
    }

    fn step(&mut self, action: Buffer) -> Result<SnapShot> {
        self.0.step(action)
    }

    fn env_description(&self) -> EnvironmentDescription {
        self.0.env_description()
    }

    fn render(&mut self) -> Result<()> {
        self.0.render()
    }

    fn close(&mut self) -> Result<()> {
        self.0.close()
    }
}

impl ExpertEnv for NaoExpertEnv {
    fn expert_action(&mut self, observation: &Buffer) -> Result<Buffer> {
        let action = Python::with_gil(|py| {
            let action = self
                .0
                .object()
                .bind(py)
                .call_method1("walking_expert_speed", (observation.data.clone(),))?;
            flatten(py, &action)
        })?;
        Ok(Buffer::from_vec(action))
    }
}

/// Adds the Nao environments to `registry`.
pub fn register_envs(registry: &mut EnvRegistry) -> &mut EnvRegistry {
    registry
        .register(NAO_ENV, |options: &EnvOptions| {
            Ok(Box::new(GymEnv::nao(NAO_ENV, options.gui)?) as BoxedEnv)
        })
        .register_expert(NAO_ENV_PRETRAINED, |options: &EnvOptions| {
            Ok(Box::new(NaoExpertEnv::new(options.gui)?) as BoxedExpertEnv)
        })
}

/// Makes the gymnasium environment `id` available as `gym:<id>`.
pub fn register_gym<'a>(registry: &'a mut EnvRegistry, id: &str) -> &'a mut EnvRegistry {
    let name = id.strip_prefix(GYM_PREFIX).unwrap_or(id).to_owned();
    registry.register(format!("{GYM_PREFIX}{name}"), move |options: &EnvOptions| {
        let render_mode = options.gui.then_some("human");
        Ok(Box::new(GymEnv::make(&name, render_mode)?) as BoxedEnv)
    })
}

/// Registry with the Nao environments and every `gym:` id in `ids`.
pub fn default_registry<'a>(ids: impl IntoIterator<Item = &'a str>) -> EnvRegistry {
    let mut registry = EnvRegistry::new();
    register_envs(&mut registry);
    for id in ids {
        if id.starts_with(GYM_PREFIX) {
            register_gym(&mut registry, id);
        }
    }
    registry
}

#[cfg(test)]
mod test {
    use super::{NAO_ENV, NAO_ENV_PRETRAINED, default_registry};

    #[test]
    fn registry_lists_nao_and_requested_gym_ids() {
        let registry = default_registry(["gym:Pendulum-v1", NAO_ENV, "Walker"]);
        let ids: Vec<&str> = registry.ids().collect();
        assert_eq!(ids, ["NaoEnv", "NaoEnvPretrained", "gym:Pendulum-v1"]);
        assert!(registry.contains(NAO_ENV_PRETRAINED));
        assert!(!registry.contains("Walker"));
    }
}
