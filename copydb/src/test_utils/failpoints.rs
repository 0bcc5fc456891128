use fail::FailScenario;

/// Failpoint configuration of one test, turned off when dropped.
///
/// Holding the [`FailScenario`] serializes the tests configuring failpoints, since the
/// registry is global to the process.
pub struct FailpointGuard<'a> {
    _scenario: FailScenario<'a>,
    names: Vec<String>,
}

impl<'a> FailpointGuard<'a> {
    /// Configures each `(name, action)` pair, e.g. `("claim.after_marker", "1*return")`.
    ///
    /// # Panics
    ///
    /// Panics when an action does not parse.
    pub fn setup(failpoints: &[(&str, &str)]) -> FailpointGuard<'a> {
        let scenario = FailScenario::setup();
        let mut names = Vec::with_capacity(failpoints.len());

        for (name, action) in failpoints {
            if let Err(err) = fail::cfg(*name, action) {
                panic!("invalid action '{action}' for failpoint '{name}': {err}");
            }
            names.push((*name).to_owned());
        }

        Self {
            _scenario: scenario,
            names,
        }
    }

    /// Fires the failpoint `name` `times` times, then lets it pass.
    pub fn fail_times(name: &str, times: u32) -> FailpointGuard<'a> {
        let action = format!("{times}*return");
        Self::setup(&[(name, action.as_str())])
    }
}

impl Drop for FailpointGuard<'_> {
    fn drop(&mut self) {
        for name in &self.names {
            fail::remove(name);
        }
    }
}
