//! Outcome planning.
//!
//! Compiles a validated [`Config`] into an ordered list of outcome ops.
//! Each op knows how to mutate shared host state through the transaction
//! engine on the privileged side (`to_system`) and how to populate the
//! container launch parameters in the shim (`to_container`). The op list and
//! the state it needs cross the process boundary as one serialised frame.

mod ops;

pub use ops::OutcomeOp;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{
    to_user, BusConfig, Config, ContainerConfig, EnablementSet, ExtraPermConfig, Flags,
};
use crate::container::Params;
use crate::error::{ConfigError, ConfigErrorKind, Error};
use crate::id::InstanceId;
use crate::path::Absolute;
use crate::system::{AclPerms, System, PROCESS, USER};

/// Parameters consumed by the shim process only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShimParams {
    /// Pid of the privileged process, for orphan detection.
    pub priv_pid: i32,
    /// Whether verbose logging is enabled.
    pub verbose: bool,
    /// Normalised wait delay in nanoseconds.
    pub wait_delay: i64,
    /// Compiled outcome ops, in planning order.
    pub ops: Vec<OutcomeOp>,
}

/// Host pathname snapshot taken on the privileged side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paths {
    /// Per-user share directory under TMPDIR.
    pub share_path: Absolute,
    /// Per-user directory under the runtime directory.
    pub run_dir_path: Absolute,
    /// XDG_RUNTIME_DIR, observed or synthesised.
    pub runtime_path: Absolute,
    /// TMPDIR, observed or `/tmp`.
    pub tmp_path: Absolute,
}

impl Paths {
    /// Derives the pathname snapshot from the environment for `user_id`.
    pub fn from_env(user_id: i32) -> Result<Self, ConfigError> {
        let err = |msg: String| ConfigError::new("derive paths", ConfigErrorKind::Invalid, msg);

        let tmp_path = std::env::var("TMPDIR")
            .ok()
            .and_then(|v| Absolute::new(&v).ok())
            .unwrap_or_else(|| Absolute::new("/tmp").expect("literal pathname"));

        let runtime_path = match std::env::var("XDG_RUNTIME_DIR") {
            Ok(v) => Absolute::new(&v).map_err(|e| err(e.to_string()))?,
            Err(_) => Absolute::new(format!("/run/user/{}", nix::unistd::getuid().as_raw()))
                .map_err(|e| err(e.to_string()))?,
        };

        Ok(Self {
            share_path: tmp_path.append(format!("hakurei.{user_id}")),
            run_dir_path: runtime_path.append("hakurei"),
            runtime_path,
            tmp_path,
        })
    }
}

/// State shared between the privileged side and the shim.
///
/// Everything here is serialised to the shim, so fields are kept to the
/// minimum the container side actually needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeState {
    pub shim: ShimParams,
    pub id: InstanceId,
    pub identity: i32,
    /// Identifier issued by the privilege broker.
    pub user_id: i32,
    /// Mapped credentials within the container user namespace.
    pub mapuid: i32,
    pub mapgid: i32,
    pub container: ContainerConfig,
    pub paths: Paths,
}

impl OutcomeState {
    /// Builds the state for one invocation.
    ///
    /// Applies the wait-delay bounds and resolves the mapped container
    /// credentials from the MapRealUID flag.
    pub fn new(
        id: InstanceId,
        config: &Config,
        user_id: i32,
        verbose: bool,
    ) -> Result<Self, Error> {
        let container = config
            .container
            .clone()
            .ok_or_else(|| {
                ConfigError::new(
                    "prepare outcome",
                    ConfigErrorKind::Null,
                    "configuration missing container state",
                )
            })?;

        let wait_delay = i64::try_from(container.normalized_wait_delay().as_nanos())
            .unwrap_or(i64::MAX);

        let (mapuid, mapgid) = if container.flags.contains(Flags::MAP_REAL_UID) {
            (
                nix::unistd::getuid().as_raw() as i32,
                nix::unistd::getgid().as_raw() as i32,
            )
        } else {
            (
                crate::container::overflow_uid(),
                crate::container::overflow_gid(),
            )
        };

        Ok(Self {
            shim: ShimParams {
                priv_pid: std::process::id() as i32,
                verbose,
                wait_delay,
                ops: Vec::new(),
            },
            id,
            identity: config.identity,
            user_id,
            mapuid,
            mapgid,
            container,
            paths: Paths::from_env(user_id)?,
        })
    }

    /// The target init-namespace uid for this instance.
    #[must_use]
    pub fn target_uid(&self) -> i32 {
        to_user(self.user_id, self.identity)
    }

    /// The per-invocation share directory under TMPDIR.
    #[must_use]
    pub fn instance_path(&self) -> Absolute {
        self.paths.share_path.append(self.id.to_string())
    }

    /// The per-invocation directory under the runtime directory.
    #[must_use]
    pub fn runtime_instance_path(&self) -> Absolute {
        self.paths.run_dir_path.append(self.id.to_string())
    }
}

/// Internal result of an op's `to_system`: the not-enabled sentinel omits
/// the op from the transmitted list and is never surfaced.
pub(crate) enum PlanError {
    NotEnabled,
    Fatal(Box<Error>),
}

impl From<Error> for PlanError {
    fn from(e: Error) -> Self {
        PlanError::Fatal(Box::new(e))
    }
}

impl From<ConfigError> for PlanError {
    fn from(e: ConfigError) -> Self {
        PlanError::Fatal(Box::new(e.into()))
    }
}

pub(crate) type PlanResult = Result<(), PlanError>;

/// Privileged-side planning state: the transaction plus lazy directory
/// helpers and the config fields ops may read.
pub struct SysState<'a> {
    pub(crate) sys: &'a mut System,
    pub(crate) state: &'a OutcomeState,

    pub(crate) app_id: String,
    pub(crate) enablements: EnablementSet,
    pub(crate) direct_wayland: bool,
    pub(crate) extra_perms: Vec<ExtraPermConfig>,
    pub(crate) session_bus: Option<BusConfig>,
    pub(crate) system_bus: Option<BusConfig>,

    use_runtime_dir: bool,
    share_path: Option<Absolute>,
    runtime_share_path: Option<Absolute>,
}

impl<'a> SysState<'a> {
    pub(crate) fn new(config: &Config, state: &'a OutcomeState, sys: &'a mut System) -> Self {
        Self {
            sys,
            state,
            app_id: config.id.clone(),
            enablements: config.enablements.unwrap_or_default().unwrap(),
            direct_wayland: config.direct_wayland,
            extra_perms: config.extra_perms.clone(),
            session_bus: config.session_bus.clone(),
            system_bus: config.system_bus.clone(),
            use_runtime_dir: false,
            share_path: None,
            runtime_share_path: None,
        }
    }

    /// Registers the runtime parent directories once.
    pub(crate) fn ensure_runtime_dir(&mut self) {
        if self.use_runtime_dir {
            return;
        }
        self.use_runtime_dir = true;
        let runtime = self.state.paths.runtime_path.clone();
        let run_dir = self.state.paths.run_dir_path.clone();
        // ensure in case XDG_RUNTIME_DIR is unset
        self.sys
            .ensure(runtime.clone(), 0o700)
            .update_perm_type(USER, runtime, AclPerms::EXECUTE)
            .ensure(run_dir.clone(), 0o700)
            .update_perm_type(USER, run_dir, AclPerms::EXECUTE);
    }

    /// The memoised per-invocation directory under TMPDIR.
    ///
    /// This directory must only hold process-scoped entries.
    pub(crate) fn instance(&mut self) -> Absolute {
        if let Some(path) = &self.share_path {
            return path.clone();
        }
        let path = self.state.instance_path();
        self.sys.ephemeral(PROCESS, path.clone(), 0o711);
        self.share_path = Some(path.clone());
        path
    }

    /// The memoised per-invocation directory under the runtime directory.
    pub(crate) fn runtime(&mut self) -> Absolute {
        if let Some(path) = &self.runtime_share_path {
            return path.clone();
        }
        self.ensure_runtime_dir();
        let path = self.state.runtime_instance_path();
        self.sys.ephemeral(PROCESS, path.clone(), 0o700);
        self.sys.update_perm(path.clone(), AclPerms::EXECUTE);
        self.runtime_share_path = Some(path.clone());
        path
    }
}

/// Shim-side application state: container params plus the env map collapsed
/// by the final op.
pub struct ParamsState<'a> {
    pub(crate) params: Params,
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) state: &'a OutcomeState,
    /// Inner XDG_RUNTIME_DIR, `/run/user/<mapped-uid>`; set by the runtime op.
    pub(crate) runtime_dir: Option<Absolute>,
}

impl<'a> ParamsState<'a> {
    pub(crate) fn new(state: &'a OutcomeState) -> Self {
        Self {
            params: Params::default(),
            env: state.container.env.clone(),
            state,
            runtime_dir: None,
        }
    }
}

/// Runs `to_system` over the full op pipeline in its fixed order,
/// populating `sys` and the transmitted op list.
///
/// Ops returning the not-enabled sentinel are filtered and never reach the
/// shim; any other failure aborts planning before commit.
pub fn plan(config: &Config, state: &mut OutcomeState, sys: &mut System) -> Result<(), Error> {
    if !state.shim.ops.is_empty() {
        return Err(ConfigError::new(
            "plan outcome",
            ConfigErrorKind::Invalid,
            "invalid ops state reached",
        )
        .into());
    }

    let mut sys_state = SysState::new(config, state, sys);
    let mut transmitted = Vec::new();

    for mut op in ops::pipeline() {
        match op.to_system(&mut sys_state) {
            Ok(()) => transmitted.push(op),
            Err(PlanError::NotEnabled) => {
                debug!(op = op.name(), "op not enabled, omitted from transmission");
            }
            Err(PlanError::Fatal(e)) => return Err(*e),
        }
    }

    state.shim.ops = transmitted;
    Ok(())
}

/// Runs `to_container` over the transmitted ops, producing the container
/// [`Params`].
pub fn to_container(state: &OutcomeState) -> Result<Params, Error> {
    let mut params_state = ParamsState::new(state);

    for op in &state.shim.ops {
        op.to_container(&mut params_state)?;
    }

    Ok(params_state.params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CgroupConfig;

    fn test_config() -> Config {
        Config {
            id: String::from("com.example.app"),
            identity: 42,
            container: Some(ContainerConfig {
                hostname: String::from("app"),
                username: String::from("chronos"),
                shell: Some(Absolute::new("/bin/sh").unwrap()),
                home: Some(Absolute::new("/home/chronos").unwrap()),
                path: Some(Absolute::new("/bin/app").unwrap()),
                args: vec![String::from("app-start")],
                ..ContainerConfig::default()
            }),
            ..Config::default()
        }
    }

    fn test_state(config: &Config) -> OutcomeState {
        OutcomeState::new(InstanceId::generate(), config, 0, false).unwrap()
    }

    #[test]
    fn test_target_uid_derivation() {
        let config = test_config();
        let mut state = test_state(&config);
        state.user_id = 1;
        assert_eq!(state.target_uid(), 110042);
    }

    #[test]
    fn test_instance_paths_carry_id() {
        let config = test_config();
        let state = test_state(&config);
        let hex = state.id.to_string();
        assert!(state.instance_path().as_str().ends_with(&hex));
        assert!(state.runtime_instance_path().as_str().ends_with(&hex));
        assert!(state
            .instance_path()
            .as_str()
            .starts_with(state.paths.share_path.as_str()));
    }

    #[test]
    fn test_wait_delay_normalised_in_state() {
        let mut config = test_config();
        config.container.as_mut().unwrap().wait_delay = -5;
        let state = test_state(&config);
        assert_eq!(state.shim.wait_delay, 0);

        let mut config = test_config();
        config.container.as_mut().unwrap().wait_delay = 60_000_000_000;
        let state = test_state(&config);
        assert_eq!(state.shim.wait_delay, 30_000_000_000);

        let config = test_config();
        let state = test_state(&config);
        assert_eq!(state.shim.wait_delay, 5_000_000_000);
    }

    #[test]
    fn test_plan_filters_disabled_ops() {
        let config = test_config();
        let mut state = test_state(&config);
        let mut sys = System::new(0);

        plan(&config, &mut state, &mut sys).expect("planning should succeed");

        let names: Vec<&str> = state.shim.ops.iter().map(OutcomeOp::name).collect();
        // no enablements, no cgroup: only the unconditional ops remain
        assert_eq!(
            names,
            vec!["params", "runtime", "tmpdir", "account", "filesystem"]
        );
    }

    #[test]
    fn test_plan_order_with_cgroup() {
        let mut config = test_config();
        config.container.as_mut().unwrap().cgroup = Some(CgroupConfig::default());
        let mut state = test_state(&config);
        let mut sys = System::new(0);

        plan(&config, &mut state, &mut sys).expect("planning should succeed");

        let names: Vec<&str> = state.shim.ops.iter().map(OutcomeOp::name).collect();
        assert_eq!(
            names,
            vec!["params", "cgroup", "runtime", "tmpdir", "account", "filesystem"]
        );
    }

    #[test]
    fn test_plan_rejects_repeated_planning() {
        let config = test_config();
        let mut state = test_state(&config);
        let mut sys = System::new(0);
        plan(&config, &mut state, &mut sys).unwrap();

        let mut sys2 = System::new(0);
        assert!(plan(&config, &mut state, &mut sys2).is_err());
    }

    #[test]
    fn test_instance_directory_registered_once() {
        let config = test_config();
        let state = test_state(&config);
        let mut sys = System::new(0);
        let mut expected = System::new(0);
        expected.ephemeral(crate::system::PROCESS, state.instance_path(), 0o711);

        let mut sys_state = SysState::new(&config, &state, &mut sys);
        let first = sys_state.instance();
        let second = sys_state.instance();
        assert_eq!(first, second);
        drop(sys_state);

        // repeated use registers exactly one ephemeral op
        assert!(sys.equal(&expected));
    }

    #[test]
    fn test_state_round_trip() {
        let mut config = test_config();
        config.container.as_mut().unwrap().cgroup = Some(CgroupConfig {
            slice: String::new(),
            limit_cpu: 50000,
            limit_memory: 2048,
            limit_pids: 16,
        });
        let mut state = test_state(&config);
        let mut sys = System::new(0);
        plan(&config, &mut state, &mut sys).unwrap();

        let json = serde_json::to_string(&state).unwrap();
        let back: OutcomeState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, state.id);
        assert_eq!(back.shim.ops.len(), state.shim.ops.len());
        assert_eq!(back.shim.wait_delay, state.shim.wait_delay);
    }
}
