//! Test doubles for seams owned by other crates

use async_trait::async_trait;
use bootline_common::command::{CommandOutput, CommandRunner};
use bootline_common::Result;
use mockall::mock;

mock! {
    pub Runner {}

    #[async_trait]
    impl CommandRunner for Runner {
        async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
    }
}
