//! Resolution of a name token into an ordered list of instances.

use regex::Regex;

use super::{Clusters, FleetError, Instance};

/// Token that selects every instance in the fleet.
pub const ALL_TOKEN: &str = "all";

/// Compiles a `*` wildcard token into an anchored regular expression.
///
/// Every character other than `*` matches literally, so `app-*` selects
/// `app-01` but neither `apptest` nor `app.01x`.
///
/// # Errors
///
/// Returns [`FleetError::Pattern`] if the generated expression fails to
/// compile.
pub fn glob_to_regex(token: &str) -> Result<Regex, FleetError> {
    let mut pattern = String::with_capacity(token.len() + 4);
    pattern.push('^');
    for (index, part) in token.split('*').enumerate() {
        if index > 0 {
            pattern.push_str(".*");
        }
        pattern.push_str(&regex::escape(part));
    }
    pattern.push('$');

    Regex::new(&pattern).map_err(|err| FleetError::Pattern {
        token: token.to_owned(),
        message: err.to_string(),
    })
}

/// Resolves `token` against the fleet.
///
/// Rules apply in order: `all`, exact cluster name, wildcard over instance
/// names, exact instance name. Results follow store iteration order. An
/// empty vector means nothing matched; callers treat it as a hard failure.
///
/// # Errors
///
/// Returns [`FleetError::Pattern`] when a wildcard token cannot be compiled.
pub fn match_instances(clusters: &Clusters, token: &str) -> Result<Vec<Instance>, FleetError> {
    if token == ALL_TOKEN {
        return Ok(collect(clusters, |_| true));
    }

    if let Some(cluster) = clusters.cluster(token) {
        return Ok(cluster.instances.values().cloned().collect());
    }

    if token.contains('*') {
        let pattern = glob_to_regex(token)?;
        return Ok(collect(clusters, |instance| pattern.is_match(&instance.name)));
    }

    Ok(collect(clusters, |instance| instance.name == token))
}

fn collect(clusters: &Clusters, keep: impl Fn(&Instance) -> bool) -> Vec<Instance> {
    clusters
        .instances()
        .filter(|(_, instance)| keep(instance))
        .map(|(_, instance)| instance.clone())
        .collect()
}
