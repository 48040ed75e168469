//! `check-nhs-number` command

use crate::domain::ids::validate;
use clap::Args;

/// Arguments for the check-nhs-number command
#[derive(Args, Debug)]
pub struct CheckNhsNumberArgs {
    /// Identifiers to check
    #[arg(value_name = "NHS_NUMBER", required = true)]
    pub numbers: Vec<String>,
}

impl CheckNhsNumberArgs {
    /// Exit code 0 when every identifier is valid, 3 otherwise
    pub fn execute(&self) -> i32 {
        let mut all_valid = true;
        for number in &self.numbers {
            match validate(number) {
                Ok(nhs) => println!("✅ {}", nhs.redacted()),
                Err(e) => {
                    all_valid = false;
                    println!("❌ {number}: {e}");
                }
            }
        }
        if all_valid {
            0
        } else {
            3
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code() {
        let args = CheckNhsNumberArgs {
            numbers: vec!["9434765919".into()],
        };
        assert_eq!(args.execute(), 0);

        let args = CheckNhsNumberArgs {
            numbers: vec!["9434765919".into(), "9434765918".into()],
        };
        assert_eq!(args.execute(), 3);
    }
}
