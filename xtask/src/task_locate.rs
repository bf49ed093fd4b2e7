// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use esp_harness::firmware::{self, ResolvedResource};

use crate::harness_args::HarnessArgs;
use crate::util::{cargo_log, cargo_warn};

/// Reports which firmware images a run would use.
pub(crate) fn cmd_locate(args: HarnessArgs) -> anyhow::Result<()> {
    let config = args.into_config()?;

    let show = |resource: &ResolvedResource| {
        cargo_log!(
            "Found",
            "{} `{}` ({})",
            resource.kind(),
            resource.path(),
            resource.source()
        );
    };

    match firmware::resolve(&config.vars_spec()) {
        Ok(template) => show(&template),
        Err(e) => cargo_warn!("{e}; runs will not have persistent NVRAM"),
    }

    let code = firmware::resolve(&config.code_spec())?;
    show(&code);
    Ok(())
}
