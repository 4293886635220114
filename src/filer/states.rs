use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Registrant state/province codes mapped to a country. Covers US states and
/// territories plus the Canadian province codes the filing authority assigns;
/// other jurisdiction codes yield no country.
static STATE_COUNTRIES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut m = HashMap::new();
    for code in [
        "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DE", "DC", "FL", "GA", "HI", "ID", "IL",
        "IN", "IA", "KS", "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE",
        "NV", "NH", "NJ", "NM", "NY", "NC", "ND", "OH", "OK", "OR", "PA", "RI", "SC", "SD",
        "TN", "TX", "UT", "VT", "VA", "WA", "WV", "WI", "WY", "X1",
    ] {
        m.insert(code, "US");
    }
    for code in [
        "A0", "A1", "A2", "A3", "A4", "A5", "A6", "A7", "A8", "A9", "B0",
    ] {
        m.insert(code, "CANADA");
    }
    m.insert("Z4", "CANADA (Federal Level)");
    m
});

/// Country for a registrant, preferring the business state over the mailing
/// state.
pub fn country_for(business_state: Option<&str>, mailing_state: Option<&str>) -> Option<String> {
    let state = business_state.or(mailing_state)?;
    STATE_COUNTRIES
        .get(state.trim().to_uppercase().as_str())
        .map(|c| (*c).to_string())
}
