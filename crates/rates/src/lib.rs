pub mod convert;
pub mod provider;

pub use convert::{Conversion, ConvertError, CurrencyConverter, ExchangeRateSnapshot};
pub use provider::{HttpRateProvider, MockRateProvider, RateError, RateProvider, RateQuote};
