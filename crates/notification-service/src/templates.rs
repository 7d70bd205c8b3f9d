use crate::{Alert, AlertType};

pub struct EmailTemplate;

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

impl EmailTemplate {
    pub fn render(alert: &Alert) -> String {
        let body_content = match &alert.alert_type {
            AlertType::RebalanceReport {
                mode,
                preview,
                sells,
                buys,
            } => {
                let (banner_color, label) = if *preview {
                    ("#3b82f6", "Rebalance Preview")
                } else {
                    ("#22c55e", "Rebalance Run")
                };
                format!(
                    r#"<div style="background:{banner_color};color:#fff;padding:12px 20px;border-radius:8px 8px 0 0;font-size:18px;font-weight:700;">{label} ({mode})</div>
<table style="width:100%;border-collapse:collapse;">
  <tr><td style="padding:8px 12px;color:#94a3b8;">Sells</td><td style="padding:8px 12px;font-weight:600;color:#ef4444;">{sells}</td></tr>
  <tr style="background:#f8fafc;"><td style="padding:8px 12px;color:#94a3b8;">Buys</td><td style="padding:8px 12px;font-weight:600;color:#22c55e;">{buys}</td></tr>
</table>"#
                )
            }
            AlertType::PortfolioReport {
                cash,
                total_value,
                positions_count,
            } => {
                format!(
                    r#"<div style="background:#1e293b;color:#fff;padding:12px 20px;border-radius:8px 8px 0 0;font-size:18px;font-weight:700;">Portfolio Report</div>
<table style="width:100%;border-collapse:collapse;">
  <tr><td style="padding:8px 12px;color:#94a3b8;">Cash</td><td style="padding:8px 12px;font-weight:600;">${cash:.2}</td></tr>
  <tr style="background:#f8fafc;"><td style="padding:8px 12px;color:#94a3b8;">Total Value</td><td style="padding:8px 12px;font-weight:600;">${total_value:.2}</td></tr>
  <tr><td style="padding:8px 12px;color:#94a3b8;">Positions</td><td style="padding:8px 12px;font-weight:600;">{positions_count}</td></tr>
</table>"#
                )
            }
            AlertType::RunSkipped { reason } => {
                let reason = escape(reason);
                format!(
                    r#"<div style="background:#f97316;color:#fff;padding:12px 20px;border-radius:8px 8px 0 0;font-size:18px;font-weight:700;">REBALANCE SKIPPED</div>
<div style="padding:16px 20px;">
  <p style="color:#334155;margin:0;">{reason}</p>
</div>"#
                )
            }
            AlertType::RunFailed { reason } => {
                let reason = escape(reason);
                format!(
                    r#"<div style="background:#ef4444;color:#fff;padding:12px 20px;border-radius:8px 8px 0 0;font-size:18px;font-weight:700;">REBALANCE FAILED</div>
<div style="padding:16px 20px;">
  <p style="color:#ef4444;font-weight:600;font-size:16px;margin:0 0 8px;">No orders were placed after the failure</p>
  <p style="color:#334155;margin:0;">{reason}</p>
</div>"#
                )
            }
        };

        format!(
            r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><meta name="viewport" content="width=device-width,initial-scale=1"></head>
<body style="margin:0;padding:0;background:#f1f5f9;font-family:-apple-system,BlinkMacSystemFont,'Segoe UI',Roboto,sans-serif;">
<table width="100%" cellpadding="0" cellspacing="0" style="background:#f1f5f9;padding:32px 0;">
  <tr><td align="center">
    <table width="600" cellpadding="0" cellspacing="0" style="background:#ffffff;border-radius:8px;overflow:hidden;box-shadow:0 1px 3px rgba(0,0,0,0.1);">
      <tr><td>
        {body_content}
      </td></tr>
      <tr><td style="padding:16px 20px;border-top:1px solid #e2e8f0;">
        <pre style="margin:0;color:#334155;font-size:12px;white-space:pre-wrap;">{msg}</pre>
        <p style="margin:8px 0 0;color:#94a3b8;font-size:12px;">Sent at {ts} UTC</p>
      </td></tr>
    </table>
    <p style="color:#94a3b8;font-size:11px;margin-top:16px;">Rebalance Notification Service</p>
  </td></tr>
</table>
</body>
</html>"#,
            msg = escape(&alert.message),
            ts = alert.timestamp.format("%Y-%m-%d %H:%M:%S"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebalance_report_includes_transcript() {
        let alert = Alert::new(
            AlertType::RebalanceReport {
                mode: "live".into(),
                preview: true,
                sells: 1,
                buys: 2,
            },
            "Faux Rebalance",
            "Sell 3 IVV (harvest loss)\nBuy 5 VOO <us_large>",
        );
        let html = EmailTemplate::render(&alert);
        assert!(html.contains("Rebalance Preview (live)"));
        assert!(html.contains("Sell 3 IVV (harvest loss)"));
        assert!(html.contains("&lt;us_large&gt;"));
    }

    #[test]
    fn test_failure_reason_is_escaped() {
        let alert = Alert::new(
            AlertType::RunFailed {
                reason: "<script>".into(),
            },
            "Rebalance failed",
            "",
        );
        let html = EmailTemplate::render(&alert);
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>"));
    }
}
