// Copyright 2025 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use log::info;
use pike::{Opt, PikeConf, PikeServer, Result};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let opt = Opt::parse_args();
    let conf = PikeConf::load_yaml_with_opt_override(&opt)?;
    if opt.test {
        info!("configuration ok");
        return Ok(());
    }

    let server = PikeServer::new(conf)?;
    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
