use lc_acme::{AcmeError, AcmeResult, DnsRecordName, OperatorPrompt};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Shows the TXT record on the terminal and waits for Enter
pub struct StdinPrompt;

#[async_trait::async_trait]
impl OperatorPrompt for StdinPrompt {
    async fn confirm(&self, record: &DnsRecordName, value: &str) -> AcmeResult<()> {
        println!();
        println!("Create the following DNS TXT record:");
        println!();
        println!("  Zone:  {}", record.apex);
        println!("  Host:  {}", record.rr);
        println!("  FQDN:  {}", record.fqdn());
        println!("  Type:  TXT");
        println!("  Value: {}", value);
        println!();
        println!("Press Enter once the record is in place...");

        let mut line = String::new();
        let read = BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await?;
        if read == 0 {
            return Err(AcmeError::Config(
                "stdin closed before the DNS record was confirmed".to_string(),
            ));
        }
        Ok(())
    }
}
