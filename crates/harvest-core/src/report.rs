//! Portfolio report sent outside of rebalance runs

use crate::engine::Transcript;
use crate::snapshot::PortfolioSnapshot;

/// One row per held position, then cash and total value.
pub fn portfolio_report(snapshot: &PortfolioSnapshot) -> Transcript {
    let mut transcript = Transcript::default();
    for position in snapshot.positions.values().filter(|p| p.quantity != 0.0) {
        transcript.push(format!(
            "{}:\tquantity: {}\tvalue: {:.2}\tprofit: {:.2}\tpercent: {:.2}",
            position.symbol,
            position.quantity,
            position.holdings_value,
            position.unrealized_profit,
            position.unrealized_profit_percent()
        ));
    }
    transcript.push(format!("cash: {:.2}", snapshot.cash));
    transcript.push(format!("total: {:.2}", snapshot.total_value()));
    transcript
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::PositionView;

    #[test]
    fn test_report_lists_positions_then_totals() {
        let snapshot = PortfolioSnapshot::new(250.0)
            .with_position(PositionView::new("VOO", 2.0, 900.0, 100.0))
            .with_position(PositionView::new("BND", 0.0, 0.0, 0.0));

        let report = portfolio_report(&snapshot);
        assert_eq!(
            report.lines(),
            &[
                "VOO:\tquantity: 2\tvalue: 900.00\tprofit: 100.00\tpercent: 12.50".to_string(),
                "cash: 250.00".to_string(),
                "total: 1150.00".to_string(),
            ]
        );
    }
}
