//! Service wiring for the HTTP layer.

use std::sync::Arc;

use chrono::{Days, Utc};

use factorops_core::{Money, TenantId};
use factorops_factoring::{Custody, Installment, InstallmentId, InstallmentStatus};
use factorops_infra::InMemoryDiscountingService;
use factorops_infra::eligibility::InMemoryEligibilityProvider;

use crate::config::ApiConfig;

/// Everything the handlers need.
pub struct AppServices {
    pub discounting: InMemoryDiscountingService,
    /// Installment source; exposed so dev tooling and tests can load receivables.
    pub eligibility: Arc<InMemoryEligibilityProvider>,
}

impl AppServices {
    pub fn in_memory() -> Self {
        let eligibility = Arc::new(InMemoryEligibilityProvider::new());
        Self {
            discounting: InMemoryDiscountingService::in_memory(eligibility.clone()),
            eligibility,
        }
    }
}

pub fn build_services(config: &ApiConfig) -> AppServices {
    let services = AppServices::in_memory();

    if config.demo_seed {
        let tenant_id = config.demo_tenant.unwrap_or_default();
        let seeded = seed_demo_installments(&services.eligibility, tenant_id);
        tracing::info!(tenant = %tenant_id, installments = seeded, "demo installments seeded");
    }

    services
}

/// A handful of receivables: some company-held, some already with a factor.
pub fn seed_demo_installments(provider: &InMemoryEligibilityProvider, tenant_id: TenantId) -> usize {
    let today = Utc::now().date_naive();
    let rows: [(&str, u32, i64, u64, InstallmentStatus, Custody); 6] = [
        ("NF-1001", 1, 100_000, 30, InstallmentStatus::Open, Custody::Company),
        ("NF-1001", 2, 100_000, 60, InstallmentStatus::Open, Custody::Company),
        ("NF-1002", 1, 50_000, 45, InstallmentStatus::Partial, Custody::Company),
        ("NF-0990", 1, 75_000, 15, InstallmentStatus::Overdue, Custody::Company),
        ("NF-0870", 1, 20_000, 20, InstallmentStatus::Open, Custody::Factor),
        ("NF-0871", 3, 32_500, 40, InstallmentStatus::Open, Custody::Factor),
    ];

    for (title, number, cents, days, status, custody) in rows {
        provider.insert(
            tenant_id,
            Installment {
                id: InstallmentId::new(),
                title_number: title.to_string(),
                installment_number: number,
                due_date: today.checked_add_days(Days::new(days)).unwrap_or(today),
                status,
                open_balance: Money::from_minor(cents),
            },
            custody,
        );
    }
    rows.len()
}
