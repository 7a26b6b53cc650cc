pub mod controller;
pub mod market_calendar;
pub mod sizer;
