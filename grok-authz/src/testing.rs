use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use anyhow::bail;

use crate::entity::Group;
use crate::entity::Project;
use crate::plugin::AuthorizationPlugin;
use crate::plugin::Setup;
use crate::request::RequestContext;

/// Allows every entity whose name starts with `allowed`.
#[derive(Default)]
pub struct AllowedPrefixPlugin;

impl AuthorizationPlugin for AllowedPrefixPlugin {
    fn is_allowed_project(&self, _request: &RequestContext, project: &Project) -> anyhow::Result<bool> {
        Ok(project.name.starts_with("allowed"))
    }

    fn is_allowed_group(&self, _request: &RequestContext, group: &Group) -> anyhow::Result<bool> {
        Ok(group.name.starts_with("allowed"))
    }
}

/// Allows every entity whose name starts with `not_allowed`.
#[derive(Default)]
pub struct NotAllowedPrefixPlugin;

impl AuthorizationPlugin for NotAllowedPrefixPlugin {
    fn is_allowed_project(&self, _request: &RequestContext, project: &Project) -> anyhow::Result<bool> {
        Ok(project.name.starts_with("not_allowed"))
    }

    fn is_allowed_group(&self, _request: &RequestContext, group: &Group) -> anyhow::Result<bool> {
        Ok(group.name.starts_with("not_allowed"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    LoadError,
    LoadPanic,
    CheckError,
    CheckPanic,
}

#[derive(Debug, Default)]
pub struct CallLog {
    pub loads: AtomicUsize,
    pub checks: AtomicUsize,
    pub unloads: AtomicUsize,
    pub last_setup: std::sync::Mutex<Setup>,
}

impl CallLog {
    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }
}

/// A plugin with a fixed verdict that records how it was driven.
pub struct ScriptedPlugin {
    verdict: bool,
    fault: Fault,
    log: Arc<CallLog>,
}

impl ScriptedPlugin {
    pub fn new(verdict: bool) -> (Box<dyn AuthorizationPlugin>, Arc<CallLog>) {
        Self::faulty(verdict, Fault::None)
    }

    pub fn faulty(verdict: bool, fault: Fault) -> (Box<dyn AuthorizationPlugin>, Arc<CallLog>) {
        let log = Arc::new(CallLog::default());
        let scripted = ScriptedPlugin {
            verdict,
            fault,
            log: log.clone(),
        };
        (Box::new(scripted), log)
    }

    fn check(&self) -> anyhow::Result<bool> {
        self.log.checks.fetch_add(1, Ordering::SeqCst);
        match self.fault {
            Fault::CheckError => bail!("backend unavailable"),
            Fault::CheckPanic => panic!("check exploded"),
            _ => Ok(self.verdict),
        }
    }
}

impl AuthorizationPlugin for ScriptedPlugin {
    fn load(&mut self, parameters: &Setup) -> anyhow::Result<()> {
        self.log.loads.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut setup) = self.log.last_setup.lock() {
            *setup = parameters.clone();
        }
        match self.fault {
            Fault::LoadError => bail!("missing credentials"),
            Fault::LoadPanic => panic!("load exploded"),
            _ => Ok(()),
        }
    }

    fn unload(&self) {
        self.log.unloads.fetch_add(1, Ordering::SeqCst);
    }

    fn is_allowed_project(&self, _request: &RequestContext, _project: &Project) -> anyhow::Result<bool> {
        self.check()
    }

    fn is_allowed_group(&self, _request: &RequestContext, _group: &Group) -> anyhow::Result<bool> {
        self.check()
    }
}
